use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Privileged actions a mixing session can be authorized to perform.
///
/// The set is closed: presentation code switches on these variants and never
/// on free-form strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    AdjustParameter,
    ApplyEq,
    ApplyCompression,
    ApplyReverb,
    EditAutomation,
    LoadPlugin,
    MixTrack,
    RenderExport,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 8] = [
        Capability::AdjustParameter,
        Capability::ApplyEq,
        Capability::ApplyCompression,
        Capability::ApplyReverb,
        Capability::EditAutomation,
        Capability::LoadPlugin,
        Capability::MixTrack,
        Capability::RenderExport,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Capability::AdjustParameter => "adjust_parameter",
            Capability::ApplyEq => "apply_eq",
            Capability::ApplyCompression => "apply_compression",
            Capability::ApplyReverb => "apply_reverb",
            Capability::EditAutomation => "edit_automation",
            Capability::LoadPlugin => "load_plugin",
            Capability::MixTrack => "mix_track",
            Capability::RenderExport => "render_export",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|cap| cap.as_str() == s)
            .ok_or_else(|| Error::UnknownCapability(s.to_string()))
    }
}
