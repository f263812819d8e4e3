//! Protocol versions and sentinel values shared by every packed structure.

/// Version written by this build.
pub const PROTOCOL_VERSION: u16 = 41 << 8;
/// The previous release; still accepted on the wire and in replay files.
pub const PREVIOUS_PROTOCOL_VERSION: u16 = 40 << 8;
/// Oldest version that can be unpacked.
pub const MIN_PROTOCOL_VERSION: u16 = PREVIOUS_PROTOCOL_VERSION;

pub const NO_VAL: u32 = 0xffff_fffe;
pub const NO_VAL16: u16 = 0xfffe;
pub const NO_VAL64: u64 = 0xffff_ffff_ffff_fffe;

#[inline]
pub fn is_supported_version(version: u16) -> bool {
    (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version)
}

pub fn format_version(version: u16) -> String {
    format!("{}.{}", version >> 8, version & 0xff)
}
