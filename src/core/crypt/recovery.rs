// src/core/crypt/recovery.rs

//! Recovery-key mnemonic generation and parsing.
//!
//! The word selection is intentionally `random_byte % 26`: each word is
//! chosen by drawing one random byte and reducing it modulo the wordlist
//! length, which is a known-biased sampling method (256 is not a multiple of
//! 26, so the first 256 % 26 = 360... i.e. the low words are a fraction more
//! likely than the high ones). This is preserved bug-for-bug rather than
//! replaced with rejection sampling; see DESIGN.md for the open-question
//! writeup on whether to fix it.

use crate::core::errors::PiccoloError;

/// Fixed 26-word list, one entry per letter, so each drawn byte maps onto a
/// single recognizable word.
pub const WORDLIST: [&str; 26] = [
    "anchor", "binder", "cradle", "dexter", "ember", "falcon", "granite", "harbor",
    "indigo", "jasper", "kindle", "lumen", "marble", "nectar", "oracle", "pillar",
    "quartz", "raptor", "silver", "thistle", "umbra", "velvet", "willow", "xenon",
    "yonder", "zephyr",
];

/// A 24-word recovery mnemonic. Each word encodes `log2(26) ~= 4.7` bits, for
/// roughly 112 bits of nominal entropy before accounting for the modulo bias.
pub const RECOVERY_WORD_COUNT: usize = 24;

#[derive(Debug, Clone)]
pub struct RecoveryMnemonic {
    words: Vec<&'static str>,
}

impl RecoveryMnemonic {
    /// Draws `RECOVERY_WORD_COUNT` words using the biased `random_byte % 26`
    /// selection described above.
    pub fn generate() -> Result<Self, PiccoloError> {
        let mut bytes = vec![0u8; RECOVERY_WORD_COUNT];
        getrandom::fill(&mut bytes).map_err(|e| PiccoloError::Crypto(e.to_string()))?;
        let words = bytes
            .into_iter()
            .map(|b| WORDLIST[(b as usize) % WORDLIST.len()])
            .collect();
        Ok(Self { words })
    }

    pub fn phrase(&self) -> String {
        self.words.join(" ")
    }

    /// Parses a space-separated phrase back into a mnemonic, validating word
    /// count and wordlist membership but not re-deriving any bias guarantee
    /// (a user-supplied phrase is taken at face value).
    pub fn parse(phrase: &str) -> Result<Self, PiccoloError> {
        let words: Vec<&'static str> = phrase
            .split_whitespace()
            .map(|w| {
                WORDLIST
                    .iter()
                    .find(|candidate| candidate.eq_ignore_ascii_case(w))
                    .copied()
                    .ok_or_else(|| PiccoloError::InvalidInput(format!("'{w}' is not a recovery word")))
            })
            .collect::<Result<_, _>>()?;
        if words.len() != RECOVERY_WORD_COUNT {
            return Err(PiccoloError::InvalidInput(format!(
                "recovery phrase must have {RECOVERY_WORD_COUNT} words, got {}",
                words.len()
            )));
        }
        Ok(Self { words })
    }

    /// Canonical byte representation fed into the Argon2id KEK derivation:
    /// the lowercase, single-space-joined phrase.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.phrase().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_24_known_words() {
        let mnemonic = RecoveryMnemonic::generate().unwrap();
        assert_eq!(mnemonic.words.len(), RECOVERY_WORD_COUNT);
        for w in &mnemonic.words {
            assert!(WORDLIST.contains(w));
        }
    }

    #[test]
    fn round_trips_through_phrase() {
        let mnemonic = RecoveryMnemonic::generate().unwrap();
        let phrase = mnemonic.phrase();
        let parsed = RecoveryMnemonic::parse(&phrase).unwrap();
        assert_eq!(parsed.phrase(), phrase);
    }

    #[test]
    fn rejects_wrong_word_count() {
        assert!(RecoveryMnemonic::parse("anchor binder").is_err());
    }

    #[test]
    fn rejects_unknown_word() {
        let mut words = vec!["anchor"; RECOVERY_WORD_COUNT];
        words[0] = "notaword";
        let phrase = words.join(" ");
        assert!(RecoveryMnemonic::parse(&phrase).is_err());
    }
}
