//! Hook for the Space Data Link Security (SDLS) protocol.
//!
//! The link layer does not know anything about the cryptographic processing. It only reserves
//! room for the security header and trailer inside the frame data field and calls the
//! transform before a frame is sent and before the data field of a received frame is
//! interpreted.
use crate::VcId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("no security association for virtual channel {0}")]
    NoSecurityAssociation(VcId),
    #[error("authentication failed")]
    AuthenticationFailure,
    #[error("invalid security header or trailer")]
    InvalidFormat,
}

/// Security transform applied to the data field of transfer frames.
///
/// The protected area of a frame is `frame[data_start..data_end]`. The security header occupies
/// the [Self::header_len] bytes at the start of that area and the security trailer the
/// [Self::trailer_len] bytes at its end.
pub trait SecurityTransform: Send + Sync {
    fn header_len(&self, vc_id: VcId) -> usize;
    fn trailer_len(&self, vc_id: VcId) -> usize;

    /// Fills the security header and trailer and encrypts or authenticates the data in place.
    /// The primary header of the frame is already written when this is called.
    fn apply(
        &self,
        vc_id: VcId,
        frame: &mut [u8],
        data_start: usize,
        data_end: usize,
    ) -> Result<(), SecurityError>;

    /// Verifies and decrypts the data in place.
    ///
    /// Returns the bounds of the plain data, with the security header and trailer removed.
    fn verify(
        &self,
        vc_id: VcId,
        frame: &mut [u8],
        data_start: usize,
        data_end: usize,
    ) -> Result<(usize, usize), SecurityError>;

    /// Total overhead added to the data field.
    fn overhead(&self, vc_id: VcId) -> usize {
        self.header_len(vc_id) + self.trailer_len(vc_id)
    }
}
