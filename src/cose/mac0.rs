use super::{Error, Result, SignatureAlgorithm};
use coset::{iana, CborSerializable, CoseMac0, CoseMac0Builder, HeaderBuilder};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Produce a detached `COSE_Mac0` (HMAC 256/256) over `payload`.
pub fn mac_detached(key: &[u8], payload: &[u8]) -> Result<CoseMac0> {
    let mac = HmacSha256::new_from_slice(key).map_err(|_| Error::InvalidMacKey)?;
    let protected = HeaderBuilder::new().algorithm(mac.algorithm()).build();
    CoseMac0Builder::new()
        .protected(protected)
        .try_create_detached_tag(payload, &[], |data| {
            let mut mac = mac.clone();
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        })
        .map(CoseMac0Builder::build)
}

/// Check a detached `COSE_Mac0` produced by [mac_detached].
pub fn verify_detached(mac0: &CoseMac0, key: &[u8], payload: &[u8]) -> Result<()> {
    let expected = coset::Algorithm::Assigned(iana::Algorithm::HMAC_256_256);
    if mac0.protected.header.alg.as_ref() != Some(&expected) {
        return Err(Error::UnsupportedAlgorithm(mac0.protected.header.alg.clone()));
    }
    mac0.verify_detached_tag(payload, &[], |tag, data| {
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| Error::InvalidMacKey)?;
        mac.update(data);
        mac.verify_slice(tag).map_err(|_| Error::MacMismatch)
    })
}

pub fn to_vec(mac0: CoseMac0) -> Result<Vec<u8>> {
    mac0.to_vec().map_err(Error::Encoding)
}

pub fn from_slice(bytes: &[u8]) -> Result<CoseMac0> {
    CoseMac0::from_slice(bytes).map_err(Error::Decoding)
}

impl SignatureAlgorithm for HmacSha256 {
    fn algorithm(&self) -> iana::Algorithm {
        iana::Algorithm::HMAC_256_256
    }
}
