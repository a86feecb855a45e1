//! Module implement the destination filename quoting layer.
//!
//! Some destination filesystems reject bytes that are legal on the
//! source side, case-insensitive filesystems being the common case.
//! The quoting layer maps every offending byte to the quoting char
//! followed by its three-digit decimal value, so `:` with `;` as the
//! quoting char becomes `;058`. Quoting applies to index components
//! only, never to the base directory, and is bijective for a fixed
//! configuration.

use lazy_static::lazy_static;
use regex::bytes::Regex;

use crate::{config::Config, Error, Result};

lazy_static! {
    // special DOS device names, invalid on FAT and NTFS even with an
    // extension attached.
    static ref DOS_DEVICE_REGEXP: Regex =
        Regex::new(r"(?i-u)^(aux|prn|con|nul|com[0-9]|lpt[1-9])(\..*)?$").unwrap();
}

/// Byte quoting engine for one quoting configuration.
///
/// Construction compiles the `chars_to_quote` character class into a
/// 256-entry lookup table, so quoting itself never touches the regex
/// engine.
#[derive(Clone)]
pub struct Quoter {
    chars_to_quote: Vec<u8>,
    quoting_char: u8,
    escape_dos_devices: bool,
    escape_trailing_spaces: bool,
    table: [bool; 256],
}

impl std::fmt::Debug for Quoter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Quoter<{:?},{:?}>",
            String::from_utf8_lossy(&self.chars_to_quote),
            self.quoting_char as char
        )
    }
}

impl Quoter {
    /// Quoter for `config`, or None when quoting is disabled.
    pub fn from_config(config: &Config) -> Result<Option<Quoter>> {
        match &config.chars_to_quote {
            Some(ctq) => Ok(Some(Quoter::new(
                ctq,
                config.quoting_char,
                config.escape_dos_devices,
                config.escape_trailing_spaces,
            )?)),
            None => Ok(None),
        }
    }

    /// `chars_to_quote` is the body of a regex character class, e.g.
    /// b"A-Z:" or b"^a-zA-Z0-9_ -.".
    pub fn new(
        chars_to_quote: &[u8],
        quoting_char: u8,
        escape_dos_devices: bool,
        escape_trailing_spaces: bool,
    ) -> Result<Quoter> {
        if !quoting_char.is_ascii() || quoting_char.is_ascii_digit() {
            err_at!(
                InvalidInput,
                msg: "invalid quoting char {:?}", quoting_char as char
            )?
        }
        let table = compile_class(chars_to_quote, quoting_char)?;
        Ok(Quoter {
            chars_to_quote: chars_to_quote.to_vec(),
            quoting_char,
            escape_dos_devices,
            escape_trailing_spaces,
            table,
        })
    }

    pub fn as_chars_to_quote(&self) -> &[u8] {
        &self.chars_to_quote
    }

    pub fn to_quoting_char(&self) -> u8 {
        self.quoting_char
    }

    pub fn to_escape_flags(&self) -> (bool, bool) {
        (self.escape_dos_devices, self.escape_trailing_spaces)
    }

    /// Quoted version of a single path component.
    pub fn quote(&self, name: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(name.len());
        for &b in name {
            if self.table[b as usize] {
                self.push_escape(&mut out, b);
            } else {
                out.push(b);
            }
        }

        if self.escape_trailing_spaces {
            match out.last().cloned() {
                Some(b @ b' ') | Some(b @ b'.') => {
                    out.pop();
                    self.push_escape(&mut out, b);
                }
                _ => (),
            }
        }

        if self.escape_dos_devices && DOS_DEVICE_REGEXP.is_match(&out) {
            let first = out.remove(0);
            let mut head = vec![];
            self.push_escape(&mut head, first);
            head.extend_from_slice(&out);
            out = head;
        }

        out
    }

    /// Original version of a quoted component. Fails if an escape
    /// group is short or encodes a value above 255.
    pub fn unquote(&self, name: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(name.len());
        let mut iter = name.iter().cloned().peekable();
        while let Some(b) = iter.next() {
            if b != self.quoting_char {
                out.push(b);
                continue;
            }
            let mut value = 0_u32;
            for _ in 0..3 {
                match iter.next() {
                    Some(d) if d.is_ascii_digit() => {
                        value = value * 10 + u32::from(d - b'0');
                    }
                    _ => err_at!(
                        QuotingError,
                        msg: "short escape group in {:?}", String::from_utf8_lossy(name)
                    )?,
                }
            }
            if value > 255 {
                err_at!(
                    QuotingError,
                    msg: "escape group out of range in {:?}", String::from_utf8_lossy(name)
                )?
            }
            out.push(value as u8);
        }
        Ok(out)
    }

    fn push_escape(&self, out: &mut Vec<u8>, b: u8) {
        out.push(self.quoting_char);
        out.extend_from_slice(format!("{:03}", b).as_bytes());
    }
}

// Evaluate the character class once per byte value; the quoting char
// itself is always in the class, else quoting would not be invertible.
fn compile_class(ctq: &[u8], quoting_char: u8) -> Result<[bool; 256]> {
    let mut pattern = String::from("(?s-u)[");
    for &b in ctq {
        match b {
            b'\\' | b'[' | b']' => {
                pattern.push('\\');
                pattern.push(b as char);
            }
            0x20..=0x7e => pattern.push(b as char),
            _ => pattern.push_str(&format!("\\x{:02x}", b)),
        }
    }
    pattern.push(']');

    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(err) => err_at!(
            InvalidInput,
            msg: "bad chars_to_quote {:?}: {}", String::from_utf8_lossy(ctq), err
        )?,
    };

    let mut table = [false; 256];
    for b in 0..=255_u8 {
        table[b as usize] = re.is_match(&[b]);
    }
    table[quoting_char as usize] = true;
    Ok(table)
}

#[cfg(test)]
#[path = "quote_test.rs"]
mod quote_test;
