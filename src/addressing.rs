//! Chunk addressing: names of chunks and containers, and the mapping from a
//! logical byte range onto per-stripe sub-ranges.
//!
//! The names produced here are wire-visible and must match what the servers
//! store byte for byte.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressingError {
    #[error("Byte range overflows: offset {offset} + length {length}")]
    RangeOverflow { offset: u64, length: usize },

    #[error("Invalid geometry: block_size={block_size}, data_stripes={data_stripes}")]
    InvalidGeometry { block_size: u64, data_stripes: usize },
}

/// `{object}.{block}.{stripe}`
pub fn chunk_name(object: &str, block: u64, stripe: usize) -> String {
    format!("{object}.{block}.{stripe}")
}

/// URL of the per-server data container
pub fn data_url(server: &str, object: &str) -> String {
    format!("{server}{object}")
}

/// URL of the per-server metadata replica
pub fn metadata_url(server: &str, object: &str) -> String {
    format!("{server}{object}.metadata")
}

/// One piece of a logical read that falls inside a single stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeSpan {
    pub block: u64,
    pub stripe: usize,
    /// Offset inside the stripe
    pub offset: usize,
    pub length: usize,
    /// Offset of this piece inside the caller's buffer
    pub buffer_offset: usize,
}

/// Split `[offset, offset + length)` into ascending per-stripe sub-ranges.
///
/// Stripes are `ceil(block_size / data_stripes)` bytes; the last data stripe
/// of a block covers whatever remains of the block.
pub fn decompose(
    offset: u64,
    length: usize,
    block_size: u64,
    data_stripes: usize,
) -> Result<Vec<StripeSpan>, AddressingError> {
    if block_size == 0 || data_stripes == 0 || block_size < data_stripes as u64 {
        return Err(AddressingError::InvalidGeometry {
            block_size,
            data_stripes,
        });
    }
    let end = offset
        .checked_add(length as u64)
        .ok_or(AddressingError::RangeOverflow { offset, length })?;

    let stripe_size = block_size.div_ceil(data_stripes as u64);
    let mut spans = Vec::new();
    let mut pos = offset;
    let mut buffer_offset = 0usize;

    while pos < end {
        let block = pos / block_size;
        let in_block = pos % block_size;
        let stripe = in_block / stripe_size;
        let in_stripe = in_block % stripe_size;
        let stripe_len = stripe_size.min(block_size - stripe * stripe_size);
        let take = (stripe_len - in_stripe).min(end - pos);

        spans.push(StripeSpan {
            block,
            stripe: stripe as usize,
            offset: in_stripe as usize,
            length: take as usize,
            buffer_offset,
        });

        pos += take;
        buffer_offset += take as usize;
    }

    Ok(spans)
}
