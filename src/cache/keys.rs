//! Cache key construction.
//!
//! A key is the escaped operation identifier followed by every argument in
//! call order, each written as `type_tag=value`. Strings are quoted, so no
//! argument can forge a separator, and the type tag keeps `f(1_i32)` apart
//! from `f(1_i64)` or `f("1")`.

use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Hex-encoded SHA-256 digest length.
const DIGEST_HEX_LEN: usize = 64;
const FOLD_SEPARATOR: char = '#';
/// Smallest `max_key_len` that still leaves room for a readable prefix.
pub const MIN_FOLDED_KEY_LEN: usize = DIGEST_HEX_LEN + 16;

/// Static type tag used to disambiguate overloads.
pub trait KeyTag {
    fn tag() -> Cow<'static, str>;
}

/// A value that can appear as an argument in a cache key.
pub trait KeyComponent {
    fn type_tag(&self) -> Cow<'static, str>;
    fn write_value(&self, out: &mut String);
}

macro_rules! display_component {
    ($($ty:ty => $tag:literal),* $(,)?) => {
        $(
            impl KeyTag for $ty {
                fn tag() -> Cow<'static, str> {
                    Cow::Borrowed($tag)
                }
            }

            impl KeyComponent for $ty {
                fn type_tag(&self) -> Cow<'static, str> {
                    <$ty as KeyTag>::tag()
                }

                fn write_value(&self, out: &mut String) {
                    let _ = write!(out, "{self}");
                }
            }
        )*
    };
}

display_component!(
    bool => "bool",
    u8 => "u8",
    u16 => "u16",
    u32 => "u32",
    u64 => "u64",
    u128 => "u128",
    usize => "usize",
    i8 => "i8",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    i128 => "i128",
    isize => "isize",
);

// Floats are written as raw bits so that `-0.0`, `0.0` and each NaN payload
// stay distinct.
impl KeyTag for f32 {
    fn tag() -> Cow<'static, str> {
        Cow::Borrowed("f32")
    }
}

impl KeyComponent for f32 {
    fn type_tag(&self) -> Cow<'static, str> {
        Self::tag()
    }

    fn write_value(&self, out: &mut String) {
        let _ = write!(out, "{:08x}", self.to_bits());
    }
}

impl KeyTag for f64 {
    fn tag() -> Cow<'static, str> {
        Cow::Borrowed("f64")
    }
}

impl KeyComponent for f64 {
    fn type_tag(&self) -> Cow<'static, str> {
        Self::tag()
    }

    fn write_value(&self, out: &mut String) {
        let _ = write!(out, "{:016x}", self.to_bits());
    }
}

impl KeyTag for str {
    fn tag() -> Cow<'static, str> {
        Cow::Borrowed("str")
    }
}

impl KeyComponent for str {
    fn type_tag(&self) -> Cow<'static, str> {
        Self::tag()
    }

    fn write_value(&self, out: &mut String) {
        out.push('"');
        for ch in self.chars() {
            if matches!(ch, '"' | '\\') {
                out.push('\\');
            }
            out.push(ch);
        }
        out.push('"');
    }
}

impl KeyTag for String {
    fn tag() -> Cow<'static, str> {
        str::tag()
    }
}

impl KeyComponent for String {
    fn type_tag(&self) -> Cow<'static, str> {
        self.as_str().type_tag()
    }

    fn write_value(&self, out: &mut String) {
        self.as_str().write_value(out);
    }
}

impl KeyTag for char {
    fn tag() -> Cow<'static, str> {
        Cow::Borrowed("char")
    }
}

impl KeyComponent for char {
    fn type_tag(&self) -> Cow<'static, str> {
        Self::tag()
    }

    fn write_value(&self, out: &mut String) {
        let _ = write!(out, "{:x}", u32::from(*self));
    }
}

impl KeyTag for Uuid {
    fn tag() -> Cow<'static, str> {
        Cow::Borrowed("uuid")
    }
}

impl KeyComponent for Uuid {
    fn type_tag(&self) -> Cow<'static, str> {
        Self::tag()
    }

    fn write_value(&self, out: &mut String) {
        let _ = write!(out, "{}", self.hyphenated());
    }
}

impl<T: KeyTag + ?Sized> KeyTag for &T {
    fn tag() -> Cow<'static, str> {
        T::tag()
    }
}

impl<T: KeyComponent + ?Sized> KeyComponent for &T {
    fn type_tag(&self) -> Cow<'static, str> {
        (**self).type_tag()
    }

    fn write_value(&self, out: &mut String) {
        (**self).write_value(out);
    }
}

impl<T: KeyTag> KeyTag for Option<T> {
    fn tag() -> Cow<'static, str> {
        Cow::Owned(format!("option<{}>", T::tag()))
    }
}

// `~` marks None and `?` prefixes Some, so nested options stay distinct.
impl<T: KeyComponent + KeyTag> KeyComponent for Option<T> {
    fn type_tag(&self) -> Cow<'static, str> {
        Self::tag()
    }

    fn write_value(&self, out: &mut String) {
        match self {
            Some(value) => {
                out.push('?');
                value.write_value(out);
            }
            None => out.push('~'),
        }
    }
}

impl<T: KeyTag> KeyTag for [T] {
    fn tag() -> Cow<'static, str> {
        Cow::Owned(format!("[{}]", T::tag()))
    }
}

impl<T: KeyComponent + KeyTag> KeyComponent for [T] {
    fn type_tag(&self) -> Cow<'static, str> {
        Self::tag()
    }

    fn write_value(&self, out: &mut String) {
        out.push('[');
        for (idx, item) in self.iter().enumerate() {
            if idx > 0 {
                out.push(';');
            }
            item.write_value(out);
        }
        out.push(']');
    }
}

impl<T: KeyTag> KeyTag for Vec<T> {
    fn tag() -> Cow<'static, str> {
        <[T]>::tag()
    }
}

impl<T: KeyComponent + KeyTag> KeyComponent for Vec<T> {
    fn type_tag(&self) -> Cow<'static, str> {
        Self::tag()
    }

    fn write_value(&self, out: &mut String) {
        self.as_slice().write_value(out);
    }
}

/// Incremental key construction.
///
/// ```
/// use cachegraph::cache::KeyBuilder;
///
/// let key = KeyBuilder::new("Catalog.find").arg(&42_u32).arg("books").finish();
/// assert_eq!(key, r#"Catalog.find(u32=42,str="books")"#);
/// ```
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    buf: String,
    args: usize,
}

impl KeyBuilder {
    pub fn new(operation_id: &str) -> Self {
        let mut buf = String::with_capacity(operation_id.len() + 32);
        for ch in operation_id.chars() {
            if matches!(ch, '(' | ')' | ',' | '=' | '\\') {
                buf.push('\\');
            }
            buf.push(ch);
        }
        buf.push('(');
        Self { buf, args: 0 }
    }

    pub fn arg<T: KeyComponent + ?Sized>(mut self, value: &T) -> Self {
        self.push_dyn(value);
        self
    }

    fn push_dyn<T: KeyComponent + ?Sized>(&mut self, value: &T) {
        if self.args > 0 {
            self.buf.push(',');
        }
        self.buf.push_str(&value.type_tag());
        self.buf.push('=');
        value.write_value(&mut self.buf);
        self.args += 1;
    }

    pub fn finish(mut self) -> String {
        self.buf.push(')');
        self.buf
    }
}

/// Build a key from an operation identifier and its ordered arguments.
pub fn build_key(operation_id: &str, args: &[&dyn KeyComponent]) -> String {
    let mut builder = KeyBuilder::new(operation_id);
    for arg in args {
        builder.push_dyn(*arg);
    }
    builder.finish()
}

/// Builds keys and folds oversized ones to a bounded length.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyCodec {
    max_key_len: Option<usize>,
}

impl KeyCodec {
    /// `max_key_len == 0` disables folding; other values are raised to
    /// [`MIN_FOLDED_KEY_LEN`].
    pub fn new(max_key_len: usize) -> Self {
        let max_key_len = (max_key_len > 0).then(|| max_key_len.max(MIN_FOLDED_KEY_LEN));
        Self { max_key_len }
    }

    pub fn max_key_len(&self) -> Option<usize> {
        self.max_key_len
    }

    pub fn build(&self, operation_id: &str, args: &[&dyn KeyComponent]) -> String {
        self.fold(build_key(operation_id, args))
    }

    /// Replace the tail of an oversized key with the digest of the whole key.
    pub fn fold(&self, key: String) -> String {
        let Some(max) = self.max_key_len else {
            return key;
        };
        if key.len() <= max {
            return key;
        }

        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hex::encode(hasher.finalize());

        let mut prefix_len = max - DIGEST_HEX_LEN - FOLD_SEPARATOR.len_utf8();
        while !key.is_char_boundary(prefix_len) {
            prefix_len -= 1;
        }

        let mut folded = String::with_capacity(max);
        folded.push_str(&key[..prefix_len]);
        folded.push(FOLD_SEPARATOR);
        folded.push_str(&digest);
        folded
    }
}

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_call_produces_same_key() {
        let a = build_key("Repo.load", &[&7_u64, &"alpha"]);
        let b = build_key("Repo.load", &[&7_u64, &"alpha"]);
        assert_eq!(a, b);
        assert_eq!(a, r#"Repo.load(u64=7,str="alpha")"#);
    }

    #[test]
    fn overloads_with_same_printed_value_differ() {
        let int32 = build_key("Repo.load", &[&1_i32]);
        let int64 = build_key("Repo.load", &[&1_i64]);
        let text = build_key("Repo.load", &[&"1"]);
        assert_ne!(int32, int64);
        assert_ne!(int32, text);
        assert_ne!(int64, text);
    }

    #[test]
    fn string_arguments_cannot_forge_separators() {
        let split = build_key("op", &[&"a", &"b"]);
        let forged = build_key("op", &[&r#"a",str="b"#]);
        assert_ne!(split, forged);
    }

    #[test]
    fn argument_order_matters() {
        assert_ne!(build_key("op", &[&1_u8, &2_u8]), build_key("op", &[&2_u8, &1_u8]));
    }

    #[test]
    fn nested_options_are_distinct() {
        let none: Option<Option<u8>> = None;
        let some_none: Option<Option<u8>> = Some(None);
        assert_ne!(build_key("op", &[&none]), build_key("op", &[&some_none]));
    }

    #[test]
    fn collections_embed_element_type() {
        let key = KeyBuilder::new("op").arg(&vec![1_u16, 2]).finish();
        assert_eq!(key, "op([u16]=[1;2])");

        let empty_u16: Vec<u16> = Vec::new();
        let empty_str: Vec<String> = Vec::new();
        assert_ne!(
            build_key("op", &[&empty_u16]),
            build_key("op", &[&empty_str])
        );
    }

    #[test]
    fn float_zero_signs_are_distinct() {
        assert_ne!(build_key("op", &[&0.0_f64]), build_key("op", &[&-0.0_f64]));
    }

    #[test]
    fn operation_id_is_escaped() {
        assert_ne!(
            build_key("op(a", &[]),
            KeyBuilder::new("op").arg("a").finish()
        );
    }

    #[test]
    fn codec_leaves_short_keys_alone() {
        let codec = KeyCodec::new(200);
        let key = codec.build("Repo.load", &[&1_u8]);
        assert_eq!(key, "Repo.load(u8=1)");
    }

    #[test]
    fn codec_folds_long_keys_deterministically() {
        let codec = KeyCodec::new(MIN_FOLDED_KEY_LEN);
        let long = "x".repeat(500);
        let first = codec.build("Repo.load", &[&long.as_str()]);
        let second = codec.build("Repo.load", &[&long.as_str()]);

        assert_eq!(first, second);
        assert_eq!(first.len(), MIN_FOLDED_KEY_LEN);
        assert!(first.starts_with("Repo.load("));

        let other = codec.build("Repo.load", &[&format!("{long}y").as_str()]);
        assert_ne!(first, other);
    }

    #[test]
    fn codec_folding_respects_char_boundaries() {
        let codec = KeyCodec::new(MIN_FOLDED_KEY_LEN);
        let wide = "é".repeat(200);
        let folded = codec.build("op", &[&wide.as_str()]);
        assert!(folded.len() <= MIN_FOLDED_KEY_LEN);
    }

    #[test]
    fn zero_disables_folding() {
        let codec = KeyCodec::new(0);
        assert!(codec.max_key_len().is_none());
        let long = "z".repeat(1000);
        assert!(codec.build("op", &[&long.as_str()]).len() > 1000);
    }
}
