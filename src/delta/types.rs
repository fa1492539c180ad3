//! Delta sync wire types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::checksum::{strong_hash, weak_hash};

/// Checksums for one block of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSignature {
    pub index: usize,
    pub weak_hash: u32,
    #[serde(rename = "hash")]
    pub strong_hash: String,
    /// Byte offset of the block within the file
    pub offset: u64,
    pub length: usize,
}

/// Block checksums of a whole file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSignature {
    pub block_size: usize,
    pub signatures: Vec<BlockSignature>,
    pub total_blocks: usize,
}

impl FileSignature {
    /// Sign pre-split blocks
    pub fn from_blocks<B: AsRef<[u8]>>(block_size: usize, blocks: &[B]) -> Self {
        let mut offset = 0u64;
        let signatures: Vec<BlockSignature> = blocks
            .iter()
            .enumerate()
            .map(|(index, block)| {
                let block = block.as_ref();
                let signature = BlockSignature {
                    index,
                    weak_hash: weak_hash(block),
                    strong_hash: strong_hash(block),
                    offset,
                    length: block.len(),
                };
                offset += block.len() as u64;
                signature
            })
            .collect();

        Self {
            block_size,
            total_blocks: signatures.len(),
            signatures,
        }
    }

    /// Sign a file held in memory
    pub fn compute(data: &[u8], block_size: usize) -> Self {
        let block_size = block_size.max(1);
        let blocks: Vec<&[u8]> = data.chunks(block_size).collect();
        Self::from_blocks(block_size, &blocks)
    }
}

/// One step of a file reconstruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum DeltaInstruction {
    /// Reuse a block of the original file
    Copy {
        #[serde(rename = "destIndex")]
        dest_index: usize,
        #[serde(rename = "sourceIndex")]
        source_block_index: usize,
    },
    /// Use a block supplied with the delta
    Insert {
        #[serde(rename = "destIndex")]
        dest_index: usize,
        #[serde(rename = "blockIndex")]
        new_block_index: usize,
    },
}

impl DeltaInstruction {
    /// Position of this block in the reconstructed file
    pub fn dest_index(&self) -> usize {
        match self {
            Self::Copy { dest_index, .. } | Self::Insert { dest_index, .. } => *dest_index,
        }
    }
}

/// Instructions plus the literal blocks they insert
#[derive(Debug, Clone, Default)]
pub struct Delta {
    pub instructions: Vec<DeltaInstruction>,
    pub new_blocks: HashMap<usize, Vec<u8>>,
    pub stats: DeltaStats,
}

/// Transfer savings of a delta
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaStats {
    pub total_blocks: usize,
    pub reused_blocks: usize,
    pub new_block_count: usize,
    /// Size of the new file
    pub original_size: u64,
    /// Bytes that must be sent
    pub delta_bytes: u64,
    pub savings_percent: f64,
}

impl DeltaStats {
    pub fn new(total_blocks: usize, reused_blocks: usize, original_size: u64, delta_bytes: u64) -> Self {
        let savings_percent = if total_blocks > 0 {
            reused_blocks as f64 * 100.0 / total_blocks as f64
        } else {
            0.0
        };

        Self {
            total_blocks,
            reused_blocks,
            new_block_count: total_blocks - reused_blocks,
            original_size,
            delta_bytes,
            savings_percent,
        }
    }

    /// Whether sending the delta beats re-uploading, at `threshold_percent` savings
    pub fn is_worthwhile(&self, threshold_percent: f64) -> bool {
        self.savings_percent >= threshold_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_wire_format() {
        let copy = DeltaInstruction::Copy { dest_index: 2, source_block_index: 7 };
        let json = serde_json::to_value(copy).unwrap();
        assert_eq!(json, serde_json::json!({"type": "COPY", "destIndex": 2, "sourceIndex": 7}));

        let insert: DeltaInstruction =
            serde_json::from_str(r#"{"type":"INSERT","destIndex":3,"blockIndex":0,"length":4096}"#)
                .unwrap();
        assert_eq!(insert, DeltaInstruction::Insert { dest_index: 3, new_block_index: 0 });
        assert_eq!(insert.dest_index(), 3);

        assert!(serde_json::from_str::<DeltaInstruction>(r#"{"type":"MOVE","destIndex":0}"#).is_err());
    }

    #[test]
    fn test_signature_offsets() {
        let signature = FileSignature::compute(b"abcdefghij", 4);
        assert_eq!(signature.total_blocks, 3);
        let offsets: Vec<u64> = signature.signatures.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(signature.signatures[2].length, 2);
    }

    #[test]
    fn test_stats() {
        let stats = DeltaStats::new(10, 8, 40_960, 8192);
        assert_eq!(stats.new_block_count, 2);
        assert_eq!(stats.savings_percent, 80.0);
        assert!(stats.is_worthwhile(20.0));
        assert!(!DeltaStats::new(10, 1, 0, 0).is_worthwhile(20.0));
        assert_eq!(DeltaStats::new(0, 0, 0, 0).savings_percent, 0.0);
    }
}
