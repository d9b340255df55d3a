//! Field decryption and display masking hooks.

use crate::config::{MaskKind, SecureMask};
use crate::error::Result;

pub const DEFAULT_MASK_CODE: char = '*';

/// Decrypts values of columns declared as encrypted.
pub trait FieldDecryptor: Send + Sync {
    fn decrypt(&self, column: &str, cipher_text: &str) -> Result<String>;
}

/// Produces the masked display form of a value.
pub trait Desensitizer: Send + Sync {
    fn mask(&self, value: &str, rule: &SecureMask) -> String;
}

/// Keep `head` leading and `tail` trailing characters, mask the rest.
/// Values too short to keep both ends are masked after the first char.
pub fn mask_middle(value: &str, head: usize, tail: usize, code: char) -> String {
    let chars: Vec<char> = value.chars().collect();
    let len = chars.len();
    if len == 0 {
        return String::new();
    }
    let (head, tail) = if head + tail >= len {
        (len.min(1), 0)
    } else {
        (head, tail)
    };
    chars
        .iter()
        .enumerate()
        .map(|(i, c)| if i < head || i >= len - tail { *c } else { code })
        .collect()
}

/// Masking rules per [`MaskKind`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDesensitizer;

impl Desensitizer for DefaultDesensitizer {
    fn mask(&self, value: &str, rule: &SecureMask) -> String {
        let code = rule.mask_code.unwrap_or(DEFAULT_MASK_CODE);
        let len = value.chars().count();
        match rule.kind {
            MaskKind::Name => mask_middle(value, 1, 0, code),
            MaskKind::Mobile => mask_middle(value, 3, 4, code),
            MaskKind::Tel => mask_middle(value, 0, 4, code),
            MaskKind::Email => match value.split_once('@') {
                Some((local, domain)) => format!("{}@{}", mask_middle(local, 1, 0, code), domain),
                None => mask_middle(value, 1, 0, code),
            },
            MaskKind::IdCard | MaskKind::BankCard => mask_middle(value, 4, 4, code),
            MaskKind::Address => mask_middle(value, 6.min(len.saturating_sub(1)), 0, code),
            MaskKind::Custom => mask_middle(
                value,
                rule.head.unwrap_or(0),
                rule.tail.unwrap_or(0),
                code,
            ),
        }
    }
}
