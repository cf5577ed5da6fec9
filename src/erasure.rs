//! Erasure Coding Module
//!
//! The decode capability the reader calls when a stripe is unreadable, behind
//! a trait so the finite-field implementation can be swapped. The default
//! implementation wraps the reed-solomon-erasure crate over GF(2^8).

use reed_solomon_erasure::galois_8::ReedSolomon;
use reed_solomon_erasure::Error as ReedSolomonError;
use thiserror::Error;

/// Errors that can occur during erasure coding operations
#[derive(Error, Debug)]
pub enum ErasureError {
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Insufficient stripes for reconstruction: need {needed}, have {available}")]
    InsufficientStripes { needed: usize, available: usize },

    #[error("Stripe count mismatch: expected {expected}, got {actual}")]
    StripeCountMismatch { expected: usize, actual: usize },

    #[error("Stripe size mismatch: expected {expected}, got {actual}")]
    StripeSizeMismatch { expected: usize, actual: usize },

    #[error("Reed-Solomon error: {0}")]
    ReedSolomon(#[from] ReedSolomonError),
}

/// Encodes parity for, and reconstructs missing members of, one block.
///
/// Slices are always `k + p` long with data stripes first; every present
/// stripe has the same length.
pub trait ErasureCodec: Send + Sync {
    fn data_stripes(&self) -> usize;

    fn parity_stripes(&self) -> usize;

    /// Fill the parity stripes from the data stripes.
    fn encode(&self, stripes: &mut [Vec<u8>]) -> Result<(), ErasureError>;

    /// Fill every `None` from the present stripes.
    fn reconstruct(&self, stripes: &mut [Option<Vec<u8>>]) -> Result<(), ErasureError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReedSolomonCodec {
    data_stripes: usize,
    parity_stripes: usize,
}

impl ReedSolomonCodec {
    pub fn new(data_stripes: usize, parity_stripes: usize) -> Result<Self, ErasureError> {
        if data_stripes == 0 {
            return Err(ErasureError::InvalidConfiguration {
                reason: "data_stripes must be greater than 0".to_string(),
            });
        }

        if parity_stripes == 0 {
            return Err(ErasureError::InvalidConfiguration {
                reason: "parity_stripes must be greater than 0".to_string(),
            });
        }

        if data_stripes + parity_stripes > 255 {
            return Err(ErasureError::InvalidConfiguration {
                reason: format!(
                    "total stripes ({}) cannot exceed 255",
                    data_stripes + parity_stripes
                ),
            });
        }

        Ok(Self {
            data_stripes,
            parity_stripes,
        })
    }

    fn total(&self) -> usize {
        self.data_stripes + self.parity_stripes
    }

    fn check_count(&self, actual: usize) -> Result<(), ErasureError> {
        if actual != self.total() {
            return Err(ErasureError::StripeCountMismatch {
                expected: self.total(),
                actual,
            });
        }
        Ok(())
    }
}

impl ErasureCodec for ReedSolomonCodec {
    fn data_stripes(&self) -> usize {
        self.data_stripes
    }

    fn parity_stripes(&self) -> usize {
        self.parity_stripes
    }

    fn encode(&self, stripes: &mut [Vec<u8>]) -> Result<(), ErasureError> {
        self.check_count(stripes.len())?;
        let rs = ReedSolomon::new(self.data_stripes, self.parity_stripes)?;
        rs.encode(stripes)?;
        Ok(())
    }

    fn reconstruct(&self, stripes: &mut [Option<Vec<u8>>]) -> Result<(), ErasureError> {
        self.check_count(stripes.len())?;

        let available = stripes.iter().filter(|s| s.is_some()).count();
        if available < self.data_stripes {
            return Err(ErasureError::InsufficientStripes {
                needed: self.data_stripes,
                available,
            });
        }

        let mut sizes = stripes.iter().flatten().map(Vec::len);
        if let Some(expected) = sizes.next() {
            if let Some(actual) = sizes.find(|&len| len != expected) {
                return Err(ErasureError::StripeSizeMismatch { expected, actual });
            }
        }

        let rs = ReedSolomon::new(self.data_stripes, self.parity_stripes)?;
        rs.reconstruct(stripes)?;
        Ok(())
    }
}

/// Split one block into `k` zero-padded data stripes of `stripe_size` bytes
/// and compute the `p` parity stripes.
pub fn encode_block(
    codec: &dyn ErasureCodec,
    block: &[u8],
    stripe_size: usize,
) -> Result<Vec<Vec<u8>>, ErasureError> {
    let k = codec.data_stripes();
    if block.len() > stripe_size * k {
        return Err(ErasureError::StripeSizeMismatch {
            expected: stripe_size * k,
            actual: block.len(),
        });
    }

    let mut stripes: Vec<Vec<u8>> = (0..k + codec.parity_stripes())
        .map(|_| vec![0u8; stripe_size])
        .collect();
    for (i, piece) in block.chunks(stripe_size).enumerate() {
        stripes[i][..piece.len()].copy_from_slice(piece);
    }
    codec.encode(&mut stripes)?;
    Ok(stripes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_codec() -> ReedSolomonCodec {
        ReedSolomonCodec::new(4, 2).unwrap()
    }

    #[test]
    fn test_codec_validation() {
        assert!(ReedSolomonCodec::new(0, 2).is_err());
        assert!(ReedSolomonCodec::new(4, 0).is_err());
        assert!(ReedSolomonCodec::new(200, 200).is_err());
    }

    #[test]
    fn test_reconstruct_missing_data_and_parity() {
        let codec = test_codec();
        let block = b"Test data for missing stripe reconstruction.".to_vec();
        let stripes = encode_block(&codec, &block, 12).unwrap();
        assert_eq!(stripes.len(), 6);

        let mut partial: Vec<Option<Vec<u8>>> = stripes.iter().cloned().map(Some).collect();
        partial[1] = None;
        partial[4] = None;

        codec.reconstruct(&mut partial).unwrap();
        let rebuilt: Vec<Vec<u8>> = partial.into_iter().flatten().collect();
        assert_eq!(rebuilt, stripes);
    }

    #[test]
    fn test_insufficient_stripes() {
        let codec = test_codec();
        let stripes = encode_block(&codec, b"Test data for insufficient stripes.", 9).unwrap();

        let mut partial: Vec<Option<Vec<u8>>> = stripes.into_iter().map(Some).collect();
        partial[0] = None;
        partial[1] = None;
        partial[2] = None;

        let result = codec.reconstruct(&mut partial);
        assert!(matches!(
            result,
            Err(ErasureError::InsufficientStripes {
                needed: 4,
                available: 3
            })
        ));
    }

    #[test]
    fn test_size_and_count_mismatch() {
        let codec = test_codec();
        let mut partial = vec![
            Some(vec![0u8; 8]),
            Some(vec![0u8; 8]),
            Some(vec![0u8; 7]),
            Some(vec![0u8; 8]),
            None,
            None,
        ];
        assert!(matches!(
            codec.reconstruct(&mut partial),
            Err(ErasureError::StripeSizeMismatch { expected: 8, actual: 7 })
        ));

        let mut short = vec![Some(vec![0u8; 8]); 5];
        assert!(matches!(
            codec.reconstruct(&mut short),
            Err(ErasureError::StripeCountMismatch { expected: 6, actual: 5 })
        ));
    }

    #[test]
    fn test_encode_block_pads_with_zeros() {
        let codec = test_codec();
        let stripes = encode_block(&codec, &[0xAB; 10], 4).unwrap();
        assert_eq!(stripes[0], vec![0xAB; 4]);
        assert_eq!(stripes[2], vec![0xAB, 0xAB, 0, 0]);
        assert_eq!(stripes[3], vec![0u8; 4]);

        assert!(encode_block(&codec, &[0u8; 17], 4).is_err());
    }
}
