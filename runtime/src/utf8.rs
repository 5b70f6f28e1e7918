//! Modified UTF-8 handling and the process-wide name intern pool.
//!
//! Class files carry strings in the Java-modified UTF-8 format: `NUL` is
//! encoded as the 2-byte form `C0 80`, 4-byte sequences are forbidden and
//! supplementary characters appear as surrogate pairs of 3-byte forms.

use crate::error::VmError;
use lasso::{Spur, ThreadedRodeo};
use std::sync::Arc;

/// Validates a modified UTF-8 byte string: 2- and 3-byte forms must carry
/// correct continuation markers, 4-byte forms and bare continuation bytes are
/// rejected.
pub fn utf8_check(src: &[u8]) -> bool {
    let mut i = 0;

    while i < src.len() {
        match src[i] >> 4 {
            0x8..=0xb => return false,
            0xc | 0xd => {
                // 110xxxxx 10xxxxxx
                if i + 1 >= src.len() || (src[i + 1] & 0xc0) != 0x80 {
                    return false;
                }
                i += 2;
            }
            0xe => {
                // 1110xxxx 10xxxxxx 10xxxxxx
                if i + 2 >= src.len()
                    || (src[i + 1] & 0xc0) != 0x80
                    || (src[i + 2] & 0xc0) != 0x80
                {
                    return false;
                }
                i += 3;
            }
            0xf => return false,
            _ => i += 1,
        }
    }

    true
}

/// Length in Java chars of a valid modified UTF-8 string, used to pre-size
/// the destination before conversion.
pub fn utf8_to_java_length(src: &[u8]) -> usize {
    let mut i = 0;
    let mut len = 0;

    while i < src.len() {
        len += 1;

        if src[i] & 0x80 != 0 {
            if src[i] & 0x20 != 0 {
                i += 3;
            } else {
                i += 2;
            }
        } else {
            i += 1;
        }
    }

    len
}

/// Decodes a valid modified UTF-8 string into Java chars.
pub fn utf8_to_java(src: &[u8]) -> Vec<u16> {
    let mut dst = Vec::with_capacity(utf8_to_java_length(src));
    let mut i = 0;

    while i < src.len() {
        match src[i] >> 4 {
            0xc | 0xd => {
                dst.push((((src[i] & 0x1f) as u16) << 6) | (src[i + 1] & 0x3f) as u16);
                i += 2;
            }
            0xe => {
                dst.push(
                    (((src[i] & 0x0f) as u16) << 12)
                        | (((src[i + 1] & 0x3f) as u16) << 6)
                        | (src[i + 2] & 0x3f) as u16,
                );
                i += 3;
            }
            _ => {
                dst.push(src[i] as u16);
                i += 1;
            }
        }
    }

    dst
}

/// Encodes Java chars into modified UTF-8. `NUL` becomes the 2-byte form,
/// everything else follows the 1/2/3-byte split on the code unit value.
pub fn java_to_utf8(data: &[u16]) -> Vec<u8> {
    let mut utf8_length = 0;

    for &jc in data {
        if (0x0001..=0x007f).contains(&jc) {
            utf8_length += 1;
        } else if jc == 0 || (0x0080..=0x07ff).contains(&jc) {
            utf8_length += 2;
        } else {
            utf8_length += 3;
        }
    }

    let mut dst = Vec::with_capacity(utf8_length);

    for &jc in data {
        if (0x0001..=0x007f).contains(&jc) {
            dst.push(jc as u8);
        } else if jc == 0 || (0x0080..=0x07ff).contains(&jc) {
            dst.push(0xc0 | ((jc >> 6) & 0x1f) as u8);
            dst.push(0x80 | (jc & 0x3f) as u8);
        } else {
            dst.push(0xe0 | (jc >> 12) as u8);
            dst.push(0x80 | ((jc >> 6) & 0x3f) as u8);
            dst.push(0x80 | (jc & 0x3f) as u8);
        }
    }

    dst
}

/// Turns a class or package name into the classfile internal form.
pub fn slashify(src: &str) -> String {
    src.replace('.', "/")
}

/// Process-wide intern pool for class, field, method and descriptor names.
/// Entries are never evicted.
#[derive(Clone)]
pub struct Utf8Pool {
    rodeo: Arc<ThreadedRodeo>,
}

impl Utf8Pool {
    pub fn new() -> Self {
        Self {
            rodeo: Arc::new(ThreadedRodeo::new()),
        }
    }

    pub fn rodeo(&self) -> &Arc<ThreadedRodeo> {
        &self.rodeo
    }

    /// Interns a modified UTF-8 byte string from a class file, rejecting
    /// ill-formed sequences.
    pub fn intern_modified(&self, src: &[u8]) -> Result<Spur, VmError> {
        if !utf8_check(src) {
            return Err(VmError::NoClassDefFound(
                "UTF8 string contains invalid characters".to_string(),
            ));
        }

        let chars = utf8_to_java(src);
        let text = String::from_utf16(&chars).map_err(|_| {
            VmError::NoClassDefFound("UTF8 string contains unpaired surrogates".to_string())
        })?;
        Ok(self.rodeo.get_or_intern(text))
    }

    pub fn intern_str(&self, src: &str) -> Spur {
        self.rodeo.get_or_intern(src)
    }

    pub fn get(&self, src: &str) -> Option<Spur> {
        self.rodeo.get(src)
    }

    pub fn resolve(&self, sym: &Spur) -> &str {
        self.rodeo.resolve(sym)
    }

    /// UTF-16 code units of an interned name.
    pub fn chars(&self, sym: &Spur) -> Vec<u16> {
        self.rodeo.resolve(sym).encode_utf16().collect()
    }
}

impl Default for Utf8Pool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"java/lang/Object".as_slice(), true)]
    #[case(b"\xc3\xa9".as_slice(), true)] // two-byte form
    #[case(b"\xe2\x82\xac".as_slice(), true)] // three-byte form
    #[case(b"\xc0\x80".as_slice(), true)] // encoded NUL
    #[case(b"\xf0\x9f\x92\xa9".as_slice(), false)] // four-byte form rejected
    #[case(b"\x80".as_slice(), false)] // bare continuation byte
    #[case(b"\xc3".as_slice(), false)] // truncated two-byte form
    #[case(b"\xe2\x82".as_slice(), false)] // truncated three-byte form
    #[case(b"\xe2\x41\x41".as_slice(), false)] // bad continuation marker
    fn check_accepts_only_wellformed_sequences(#[case] src: &[u8], #[case] valid: bool) {
        assert_eq!(utf8_check(src), valid);
    }

    #[test]
    fn conversion_round_trips_java_chars() {
        let chars: Vec<u16> = vec![0, 0x41, 0x7f, 0x80, 0x7ff, 0x800, 0xffff];
        assert_eq!(utf8_to_java(&java_to_utf8(&chars)), chars);
    }

    #[test]
    fn conversion_round_trips_modified_utf8() {
        let src = b"ab\xc0\x80\xc3\xa9\xe2\x82\xac";
        assert!(utf8_check(src));
        assert_eq!(java_to_utf8(&utf8_to_java(src)), src);
    }

    #[test]
    fn java_length_matches_decoded_length() {
        let src = b"a\xc3\xa9\xe2\x82\xacz";
        assert_eq!(utf8_to_java_length(src), utf8_to_java(src).len());
    }

    #[test]
    fn nul_uses_the_two_byte_form() {
        assert_eq!(java_to_utf8(&[0]), vec![0xc0, 0x80]);
    }

    #[test]
    fn slashify_is_idempotent_on_internal_names() {
        assert_eq!(slashify("java.lang.Object"), "java/lang/Object");
        assert_eq!(slashify("java/lang/Object"), "java/lang/Object");
    }
}
