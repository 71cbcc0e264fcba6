//! Voucher code generation.

use crate::error::{Error, Result};
use crate::model::VoucherCode;
use rand::Rng;

/// Uppercase letters and digits without the look-alikes 0, O, 1, I and L.
pub const DEFAULT_ALPHABET: &str = "ABCDEFGHJKMNPQRSTUVWXYZ23456789";

pub const DEFAULT_CODE_LENGTH: usize = 10;

/// Random fixed-length code generator.
#[derive(Clone, Debug)]
pub struct CodeGenerator {
    alphabet: Vec<char>,
    length: usize,
}

impl CodeGenerator {
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for an empty length, an alphabet with
    /// fewer than two symbols, repeated symbols, or symbols that typed input
    /// canonicalization would rewrite (whitespace, lowercase).
    pub fn new(alphabet: &str, length: usize) -> Result<Self> {
        let symbols: Vec<char> = alphabet.chars().collect();
        let mut deduped = symbols.clone();
        deduped.sort_unstable();
        deduped.dedup();

        if length == 0 {
            return Err(Error::ConfigError("code length must be positive".to_string()));
        }
        if symbols.len() < 2 || deduped.len() != symbols.len() {
            return Err(Error::ConfigError(format!(
                "code alphabet {:?} must hold at least two distinct symbols",
                alphabet
            )));
        }
        if let Some(bad) = symbols
            .iter()
            .find(|c| c.is_whitespace() || !c.to_uppercase().eq(std::iter::once(**c)))
        {
            return Err(Error::ConfigError(format!(
                "code alphabet symbol {:?} would not survive typed input",
                bad
            )));
        }

        Ok(CodeGenerator {
            alphabet: symbols,
            length,
        })
    }

    /// Generate a code from the thread-local RNG.
    pub fn generate(&self) -> VoucherCode {
        self.generate_with(&mut rand::rng())
    }

    /// Generate a code from a caller-supplied RNG (deterministic in tests).
    pub fn generate_with<R: Rng>(&self, rng: &mut R) -> VoucherCode {
        let code: String = (0..self.length)
            .map(|_| self.alphabet[rng.random_range(0..self.alphabet.len())])
            .collect();
        VoucherCode::new(code)
    }

    /// Whether `code` has this generator's shape.
    pub fn is_well_formed(&self, code: &VoucherCode) -> bool {
        code.as_str().chars().count() == self.length
            && code.as_str().chars().all(|c| self.alphabet.contains(&c))
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        CodeGenerator {
            alphabet: DEFAULT_ALPHABET.chars().collect(),
            length: DEFAULT_CODE_LENGTH,
        }
    }
}
