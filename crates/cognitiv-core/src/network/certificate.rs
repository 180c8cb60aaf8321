//! PEM-armoured CA certificates
//!
//! The TLS stack wants the DER bytes; provisioning hands out PEM text.

use base64::engine::general_purpose::STANDARD;
use base64::{DecodeSliceError, Engine};
use thiserror_no_std::Error;

const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const END: &str = "-----END CERTIFICATE-----";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateError {
    #[error("no PEM certificate block")]
    MissingBlock,
    #[error("certificate body is not valid base64")]
    Encoding,
    #[error("certificate does not fit in {0} bytes")]
    TooLarge(usize),
}

/// Decode the first certificate block in `pem` into `out`.
///
/// Lines are decoded one at a time, so each must hold whole base64 quanta
/// (any multiple of four characters, as PEM writers emit). `out` needs a
/// couple of bytes beyond the DER length.
pub fn pem_to_der<'o>(pem: &str, out: &'o mut [u8]) -> Result<&'o [u8], CertificateError> {
    let start = pem.find(BEGIN).ok_or(CertificateError::MissingBlock)? + BEGIN.len();
    let len = pem[start..]
        .find(END)
        .ok_or(CertificateError::MissingBlock)?;
    let body = &pem[start..start + len];

    let capacity = out.len();
    let mut written = 0;
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        written += STANDARD
            .decode_slice(line, &mut out[written..])
            .map_err(|e| match e {
                DecodeSliceError::OutputSliceTooSmall => CertificateError::TooLarge(capacity),
                DecodeSliceError::DecodeError(_) => CertificateError::Encoding,
            })?;
    }

    if written == 0 {
        return Err(CertificateError::MissingBlock);
    }
    Ok(&out[..written])
}
