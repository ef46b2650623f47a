//! M-of-N signature aggregation for a single outbound Bitcoin spend
//!
//! Signers are fixed at construction and their position is canonical: the
//! redeem script lists public keys in the same order, and `OP_CHECKMULTISIG`
//! requires signatures in that relative order.

use super::{hex_bytes, Address};
use crate::error::{BridgeError, BridgeResult};

use serde::{Deserialize, Serialize};

/// One validator's signature for a slot of the aggregator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub index: usize,
    pub address: Address,
    #[serde(with = "hex_bytes")]
    pub sign: Vec<u8>,
}

/// Threshold signature collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSig {
    #[serde(with = "hex_bytes")]
    message: Vec<u8>,
    m: usize,
    signers: Vec<Address>,
    signatures: Vec<Option<Signature>>,
}

impl MultiSig {
    /// Create an empty aggregator requiring `m` of `signers`
    pub fn new(message: impl Into<Vec<u8>>, m: usize, signers: Vec<Address>) -> BridgeResult<Self> {
        let n = signers.len();
        if m == 0 || m > n {
            return Err(BridgeError::InvalidThreshold { m, n });
        }

        Ok(Self {
            message: message.into(),
            m,
            signatures: vec![None; n],
            signers,
        })
    }

    /// Add a signature to its slot.
    ///
    /// The slot must belong to the claimed address. Re-submitting the exact
    /// same signature is accepted; a different value for a filled slot is not.
    pub fn add_signature(&mut self, signature: Signature) -> BridgeResult<()> {
        let n = self.signers.len();
        let index = signature.index;

        let expected = self
            .signers
            .get(index)
            .ok_or(BridgeError::SignatureIndexOutOfRange { index, n })?;

        if *expected != signature.address {
            return Err(BridgeError::SignerMismatch {
                index,
                claimed: signature.address.to_string(),
                expected: expected.to_string(),
            });
        }

        if signature.sign.is_empty() {
            return Err(BridgeError::EmptySignature { index });
        }

        match &self.signatures[index] {
            Some(existing) if *existing != signature => {
                Err(BridgeError::SlotAlreadySigned { index })
            }
            _ => {
                self.signatures[index] = Some(signature);
                Ok(())
            }
        }
    }

    /// True once at least `m` slots are filled
    pub fn is_valid(&self) -> bool {
        self.signature_count() >= self.m
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.iter().filter(|s| s.is_some()).count()
    }

    pub fn has_address_signed(&self, address: &Address) -> bool {
        self.signatures
            .iter()
            .flatten()
            .any(|s| s.address == *address)
    }

    /// Collected signature records, in slot order
    pub fn signatures(&self) -> Vec<Signature> {
        self.signatures.iter().flatten().cloned().collect()
    }

    /// Signature bytes of filled slots in ascending slot index
    pub fn signatures_in_order(&self) -> Vec<Vec<u8>> {
        self.signatures
            .iter()
            .flatten()
            .map(|s| s.sign.clone())
            .collect()
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn threshold(&self) -> usize {
        self.m
    }

    pub fn signers(&self) -> &[Address] {
        &self.signers
    }

    /// Index of `address` in the signer list
    pub fn signer_index(&self, address: &Address) -> Option<usize> {
        self.signers.iter().position(|s| s == address)
    }

    /// Canonical wire encoding
    pub fn to_bytes(&self) -> BridgeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and re-validate the structural invariants
    pub fn from_bytes(bytes: &[u8]) -> BridgeResult<Self> {
        let ms: MultiSig = serde_json::from_slice(bytes)?;
        ms.validate()?;
        Ok(ms)
    }

    fn validate(&self) -> BridgeResult<()> {
        let n = self.signers.len();
        if self.m == 0 || self.m > n {
            return Err(BridgeError::InvalidThreshold { m: self.m, n });
        }
        if self.signatures.len() != n {
            return Err(BridgeError::Validation(format!(
                "multisig has {} signature slots for {} signers",
                self.signatures.len(),
                n
            )));
        }

        for (i, slot) in self.signatures.iter().enumerate() {
            if let Some(sig) = slot {
                if sig.index != i || sig.address != self.signers[i] {
                    return Err(BridgeError::Validation(format!(
                        "signature in slot {} does not belong to signer {}",
                        i, self.signers[i]
                    )));
                }
                if sig.sign.is_empty() {
                    return Err(BridgeError::EmptySignature { index: i });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn sig(index: usize, address: &str, sign: &str) -> Signature {
        Signature {
            index,
            address: addr(address),
            sign: hex::decode(sign).unwrap(),
        }
    }

    fn signers() -> Vec<Address> {
        vec![addr("aaaaaa"), addr("bbbbbb"), addr("cccccc"), addr("dddddd")]
    }

    #[test]
    fn test_threshold_bounds() {
        assert!(matches!(
            MultiSig::new(b"msg".to_vec(), 0, signers()),
            Err(BridgeError::InvalidThreshold { m: 0, n: 4 })
        ));
        assert!(matches!(
            MultiSig::new(b"msg".to_vec(), 5, signers()),
            Err(BridgeError::InvalidThreshold { m: 5, n: 4 })
        ));
        assert!(MultiSig::new(b"msg".to_vec(), 1, vec![]).is_err());
        assert!(MultiSig::new(b"msg".to_vec(), 4, signers()).is_ok());
    }

    #[test]
    fn test_three_of_four_scenario() {
        let mut ms = MultiSig::new(b"msg".to_vec(), 3, signers()).unwrap();

        assert!(ms.add_signature(sig(2, "dddddd", "dddddd")).is_err());
        ms.add_signature(sig(3, "dddddd", "dddddd")).unwrap();
        assert!(matches!(
            ms.add_signature(sig(1, "aaaaaa", "aaaaaa")),
            Err(BridgeError::SignerMismatch { index: 1, .. })
        ));

        ms.add_signature(sig(0, "aaaaaa", "aaaaaa")).unwrap();
        assert!(!ms.is_valid());

        ms.add_signature(sig(1, "bbbbbb", "bbbbbb")).unwrap();
        assert!(ms.is_valid());

        assert!(ms.has_address_signed(&addr("bbbbbb")));
        assert!(!ms.has_address_signed(&addr("cccccc")));

        let in_order: Vec<String> = ms.signatures_in_order().iter().map(hex::encode).collect();
        assert_eq!(in_order, vec!["aaaaaa", "bbbbbb", "dddddd"]);

        let records = ms.signatures();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].index, 3);
    }

    #[test]
    fn test_threshold_validity_for_every_m() {
        for n in 1..=5usize {
            let signers: Vec<Address> = (0..n).map(|i| Address::new(vec![i as u8 + 1])).collect();
            for m in 1..=n {
                let mut ms = MultiSig::new(b"m".to_vec(), m, signers.clone()).unwrap();
                for (i, signer) in signers.iter().enumerate() {
                    assert_eq!(ms.is_valid(), i >= m);
                    ms.add_signature(Signature {
                        index: i,
                        address: signer.clone(),
                        sign: vec![0x30, i as u8],
                    })
                    .unwrap();
                }
                assert!(ms.is_valid());
            }
        }
    }

    #[test]
    fn test_rejected_signature_leaves_slot_untouched() {
        let mut ms = MultiSig::new(b"msg".to_vec(), 2, signers()).unwrap();
        ms.add_signature(sig(1, "bbbbbb", "0101")).unwrap();
        let before = ms.clone();

        assert!(ms.add_signature(sig(1, "cccccc", "0202")).is_err());
        assert!(ms.add_signature(sig(9, "bbbbbb", "0202")).is_err());
        assert!(matches!(
            ms.add_signature(sig(1, "bbbbbb", "0202")),
            Err(BridgeError::SlotAlreadySigned { index: 1 })
        ));
        assert!(matches!(
            ms.add_signature(sig(2, "cccccc", "")),
            Err(BridgeError::EmptySignature { index: 2 })
        ));
        assert_eq!(ms, before);

        // identical resubmission is accepted
        ms.add_signature(sig(1, "bbbbbb", "0101")).unwrap();
        assert_eq!(ms, before);
    }

    #[test]
    fn test_order_independent_of_insertion() {
        let mut ms = MultiSig::new(b"msg".to_vec(), 4, signers()).unwrap();
        ms.add_signature(sig(3, "dddddd", "04")).unwrap();
        ms.add_signature(sig(1, "bbbbbb", "02")).unwrap();
        ms.add_signature(sig(2, "cccccc", "03")).unwrap();
        ms.add_signature(sig(0, "aaaaaa", "01")).unwrap();

        assert_eq!(
            ms.signatures_in_order(),
            vec![vec![1], vec![2], vec![3], vec![4]]
        );
    }

    #[test]
    fn test_bytes_roundtrip() {
        let ms = MultiSig::new(b"a22b23c32d534".to_vec(), 2, signers()).unwrap();
        let decoded = MultiSig::from_bytes(&ms.to_bytes().unwrap()).unwrap();
        assert_eq!(ms, decoded);

        let mut signed = ms;
        signed.add_signature(sig(0, "aaaaaa", "3044")).unwrap();
        signed.add_signature(sig(2, "cccccc", "3045")).unwrap();
        let decoded = MultiSig::from_bytes(&signed.to_bytes().unwrap()).unwrap();
        assert_eq!(signed, decoded);
        assert!(decoded.is_valid());
    }

    #[test]
    fn test_from_bytes_rejects_misplaced_signature() {
        let mut ms = MultiSig::new(b"msg".to_vec(), 2, signers()).unwrap();
        ms.add_signature(sig(0, "aaaaaa", "01")).unwrap();

        let mut value: serde_json::Value = serde_json::from_slice(&ms.to_bytes().unwrap()).unwrap();
        value["signatures"][0]["address"] = serde_json::json!("bbbbbb");
        let tampered = serde_json::to_vec(&value).unwrap();

        assert!(MultiSig::from_bytes(&tampered).is_err());
    }
}
