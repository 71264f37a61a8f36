//! Challenge production and verification for consent checkpoints.
//!
//! The authority only owns the token lifecycle. What the user is asked, and
//! whether their answer is good enough, is delegated to a [`ChallengeBridge`].

use policy::Capability;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use subtle::ConstantTimeEq;

use crate::acc::TokenId;

/// Bridge between the authority and whatever collects the user's response.
///
/// `verify` is called without any authority lock held, at most once per token.
pub trait ChallengeBridge: Send + Sync {
    /// Produce the challenge payload shown to the user for a new token.
    fn issue(&self, token: TokenId, capability: Capability) -> String;

    /// Decide whether `response` answers the challenge issued for `token`.
    fn verify(&self, token: TokenId, response: &str) -> bool;

    /// Forget any state held for `token`.
    fn discard(&self, _token: TokenId) {}
}

/// Styles of challenge. Varied so confirmation cannot become a reflex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// Type a short random code.
    #[default]
    TypeCode,
    /// Say a phrase from a fixed list.
    VoicePhrase,
    /// Perform a named gesture.
    DeliberateGesture,
    /// Answer a question in your own words.
    ArticulatedUnderstanding,
}

const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";

const PHRASES: &[&str] = &[
    "i want to continue",
    "yes i understand",
    "lets keep going",
    "im still here",
    "i approve of this",
    "continue the mix",
    "proceed please",
    "this looks good",
];

const GESTURES: &[&str] = &[
    "double_tap_center",
    "swipe_up_then_down",
    "pinch_expand",
    "long_press_3sec",
    "tap_top_left",
];

const QUESTIONS: &[&str] = &[
    "Why are you continuing this session? (explain in 3+ words)",
    "What will happen next? (summarize in your own words)",
    "Are you sure you want to proceed? (say yes or no with reason)",
];

/// Minimum word count for an articulated answer.
pub const MIN_ARTICULATED_WORDS: usize = 3;

enum Expected {
    Digest([u8; 32]),
    Articulation,
}

/// Built-in bridge that keeps only a SHA-256 digest of each expected answer.
pub struct HashedChallengeBridge {
    kind: ChallengeKind,
    expected: Mutex<HashMap<TokenId, (ChallengeKind, Expected)>>,
}

impl HashedChallengeBridge {
    pub fn new(kind: ChallengeKind) -> Self {
        Self {
            kind,
            expected: Mutex::new(HashMap::new()),
        }
    }

    fn generate(&self) -> (String, Expected) {
        let mut rng = OsRng;
        match self.kind {
            ChallengeKind::TypeCode => {
                let code = type_code(&mut rng);
                let expected = Expected::Digest(digest(&code));
                (format!("Type this code to continue: {code}"), expected)
            }
            ChallengeKind::VoicePhrase => {
                let phrase = pick(PHRASES, &mut rng);
                (
                    format!("Say this to continue: \"{phrase}\""),
                    Expected::Digest(digest(phrase)),
                )
            }
            ChallengeKind::DeliberateGesture => {
                let gesture = pick(GESTURES, &mut rng);
                (format!("Gesture: {gesture}"), Expected::Digest(digest(gesture)))
            }
            ChallengeKind::ArticulatedUnderstanding => {
                let question = pick(QUESTIONS, &mut rng);
                (format!("Answer this: {question}"), Expected::Articulation)
            }
        }
    }
}

impl Default for HashedChallengeBridge {
    fn default() -> Self {
        Self::new(ChallengeKind::default())
    }
}

impl ChallengeBridge for HashedChallengeBridge {
    fn issue(&self, token: TokenId, _capability: Capability) -> String {
        let (payload, expected) = self.generate();
        self.expected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, (self.kind, expected));
        payload
    }

    fn verify(&self, token: TokenId, response: &str) -> bool {
        let entry = self
            .expected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token);
        let Some((kind, expected)) = entry else {
            return false;
        };

        match expected {
            Expected::Digest(want) => {
                let got = digest(&normalize(kind, response));
                got.as_slice().ct_eq(want.as_slice()).into()
            }
            Expected::Articulation => {
                response.split_whitespace().count() >= MIN_ARTICULATED_WORDS
            }
        }
    }

    fn discard(&self, token: TokenId) {
        self.expected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token);
    }
}

// Two letters, a digit, two letters, a digit.
fn type_code<R: Rng>(rng: &mut R) -> String {
    let mut code = String::with_capacity(6);
    for _ in 0..2 {
        code.push(char::from(LETTERS[rng.gen_range(0..LETTERS.len())]));
        code.push(char::from(LETTERS[rng.gen_range(0..LETTERS.len())]));
        code.push(char::from(DIGITS[rng.gen_range(0..DIGITS.len())]));
    }
    code
}

fn pick<'a, R: Rng>(options: &[&'a str], rng: &mut R) -> &'a str {
    options.choose(rng).copied().unwrap_or_default()
}

fn normalize(kind: ChallengeKind, response: &str) -> String {
    let trimmed = response.trim();
    match kind {
        ChallengeKind::TypeCode => trimmed.to_ascii_uppercase(),
        ChallengeKind::VoicePhrase => trimmed.to_lowercase(),
        ChallengeKind::DeliberateGesture | ChallengeKind::ArticulatedUnderstanding => {
            trimmed.to_string()
        }
    }
}

fn digest(s: &str) -> [u8; 32] {
    Sha256::digest(s.as_bytes()).into()
}
