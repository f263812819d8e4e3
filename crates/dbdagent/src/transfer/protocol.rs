use tokio_util::codec::length_delimited::{Builder, LengthDelimitedCodec};

/// Frames are prefixed by a big-endian `u32` length.
pub fn make_protocol_builder() -> Builder {
    *LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(crate::MAX_FRAME_SIZE)
}
