// This code is part of Qiskit.
//
// (C) Copyright IBM 2023
//
// This code is licensed under the Apache License, Version 2.0. You may
// obtain a copy of this license in the LICENSE.txt file in the root directory
// of this source tree or at http://www.apache.org/licenses/LICENSE-2.0.
//
// Any modifications or derivative works of this code must retain this
// copyright notice, and modified files need to carry a notice indicating
// that they have been altered from the originals.

use hashbrown::HashMap;

use crate::errors::MitigationError;

/// Strip the register separators counts keys may carry ('_' and ' ').
#[inline]
pub fn normalize_key(key: &str) -> String {
    key.replace(|c| c == '_' || c == ' ', "")
}

/// Bidirectional mapping between bitstrings over an ordered qubit subset and
/// dense integer indices in `[0, 2^k)`.
///
/// The subset `[q0, q1, ..., q{k-1}]` assigns bit `i` of the index to qubit
/// `q_i`; in string form that bit is the character at position `k - 1 - i`,
/// i.e. the rightmost character belongs to the first qubit of the subset.
/// The same convention is applied everywhere a counts key is read.
#[derive(Clone, Debug)]
pub struct BitstringIndex {
    qubits: Vec<u32>,
    positions: HashMap<u32, usize>,
}

impl BitstringIndex {
    pub fn new(qubits: &[u32]) -> Self {
        let positions = qubits
            .iter()
            .enumerate()
            .map(|(pos, qubit)| (*qubit, pos))
            .collect();
        BitstringIndex {
            qubits: qubits.to_vec(),
            positions,
        }
    }

    #[inline]
    pub fn num_qubits(&self) -> usize {
        self.qubits.len()
    }

    #[inline]
    pub fn qubits(&self) -> &[u32] {
        &self.qubits
    }

    /// Size of the index space, `2^k`.
    #[inline]
    pub fn dimension(&self) -> u64 {
        1u64 << self.qubits.len()
    }

    /// Position of `qubit` within the subset order.
    pub fn position(&self, qubit: u32) -> Result<usize, MitigationError> {
        self.positions
            .get(&qubit)
            .copied()
            .ok_or(MitigationError::UnknownQubit(qubit))
    }

    /// Encode a (possibly separator-carrying) bitstring key into its index.
    pub fn encode(&self, key: &str) -> Result<u64, MitigationError> {
        let bits = normalize_key(key);
        let k = self.qubits.len();
        if bits.len() != k {
            let found = bits.len();
            return Err(MitigationError::InvalidLength {
                bits,
                found,
                expected: k,
            });
        }
        let mut index = 0u64;
        for (position, byte) in bits.bytes().enumerate() {
            match byte {
                b'0' => (),
                b'1' => index |= 1u64 << (k - 1 - position),
                _ => {
                    return Err(MitigationError::InvalidBit {
                        bits: bits.clone(),
                        position,
                    });
                }
            }
        }
        Ok(index)
    }

    /// Decode an index back into its fixed-width bitstring key.
    pub fn decode(&self, index: u64) -> String {
        let k = self.qubits.len();
        (0..k)
            .map(|bit| {
                if index >> (k - 1 - bit) & 1 == 1 {
                    '1'
                } else {
                    '0'
                }
            })
            .collect()
    }

    /// Project a bitstring over this subset onto the sub-list `onto`,
    /// producing the induced bitstring in `onto` order.  Runs in O(k).
    pub fn project(&self, key: &str, onto: &[u32]) -> Result<String, MitigationError> {
        let bits = normalize_key(key);
        let k = self.qubits.len();
        if bits.len() != k {
            let found = bits.len();
            return Err(MitigationError::InvalidLength {
                bits,
                found,
                expected: k,
            });
        }
        let key_arr = bits.as_bytes();
        onto.iter()
            .map(|qubit| {
                let position = self.position(*qubit)?;
                Ok(key_arr[k - 1 - position] as char)
            })
            .rev()
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let index = BitstringIndex::new(&[0, 1, 2]);
        assert_eq!(index.encode("001").unwrap(), 1);
        assert_eq!(index.encode("100").unwrap(), 4);
        for i in 0..8 {
            assert_eq!(index.encode(&index.decode(i)).unwrap(), i);
        }
    }

    #[test]
    fn test_separators_stripped() {
        let index = BitstringIndex::new(&[5, 7, 11, 13]);
        assert_eq!(index.encode("10 1_1").unwrap(), index.encode("1011").unwrap());
    }

    #[test]
    fn test_length_and_alphabet_errors() {
        let index = BitstringIndex::new(&[0, 1]);
        assert!(matches!(
            index.encode("011"),
            Err(MitigationError::InvalidLength { found: 3, expected: 2, .. })
        ));
        assert!(matches!(
            index.encode("0x"),
            Err(MitigationError::InvalidBit { position: 1, .. })
        ));
    }

    #[test]
    fn test_project_subset() {
        // Subset [2, 4, 6]; "011" means qubit 2 -> '1', qubit 4 -> '1',
        // qubit 6 -> '0'.
        let index = BitstringIndex::new(&[2, 4, 6]);
        assert_eq!(index.project("011", &[2]).unwrap(), "1");
        assert_eq!(index.project("011", &[6, 2]).unwrap(), "10");
        assert!(matches!(
            index.project("011", &[3]),
            Err(MitigationError::UnknownQubit(3))
        ));
    }
}
