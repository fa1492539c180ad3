//! Delta computation and application
//!
//! `compute_delta` runs the rsync scan on the client's copy of a file against
//! the server's signature. `apply_instructions` rebuilds a file from the
//! original blocks and a delta.

use std::collections::HashMap;

use super::checksum::{strong_hash, RollingChecksum};
use super::types::{BlockSignature, Delta, DeltaInstruction, DeltaStats, FileSignature};

/// Compute the instructions that turn the signed file into `data`.
///
/// Every offset of `data` is checked against the signature's weak checksums.
/// A weak match only becomes a `Copy` once the strong hash agrees. Bytes that
/// match nothing are sent as `Insert` literals of at most one block.
pub fn compute_delta(data: &[u8], signature: &FileSignature) -> Delta {
    let block_size = signature.block_size.max(1);

    let mut by_weak: HashMap<u32, Vec<&BlockSignature>> = HashMap::new();
    let mut short_blocks: HashMap<&str, &BlockSignature> = HashMap::new();
    for sig in &signature.signatures {
        if sig.length == block_size {
            by_weak.entry(sig.weak_hash).or_default().push(sig);
        } else if sig.length > 0 {
            short_blocks.entry(sig.strong_hash.as_str()).or_insert(sig);
        }
    }

    let mut out = DeltaBuilder::new(block_size);
    let mut rolling: Option<RollingChecksum> = None;
    let mut pos = 0;

    while pos < data.len() {
        let remaining = data.len() - pos;

        if remaining < block_size {
            // Only a short original block can match the tail
            let tail = &data[pos..];
            match short_blocks.get(strong_hash(tail).as_str()) {
                Some(sig) if sig.length == tail.len() => out.copy(sig.index),
                _ => out.literal(tail),
            }
            break;
        }

        let window = &data[pos..pos + block_size];
        let weak = rolling
            .get_or_insert_with(|| RollingChecksum::new(window))
            .value();

        if let Some(candidates) = by_weak.get(&weak) {
            let strong = strong_hash(window);
            if let Some(sig) = candidates.iter().find(|s| s.strong_hash == strong) {
                out.copy(sig.index);
                pos += block_size;
                rolling = None;
                continue;
            }
        }

        out.literal(&data[pos..pos + 1]);
        if pos + block_size < data.len() {
            if let Some(checksum) = rolling.as_mut() {
                checksum.roll(data[pos], data[pos + block_size]);
            }
        } else {
            rolling = None;
        }
        pos += 1;
    }

    out.finish(data.len() as u64)
}

/// Rebuild a file from its original blocks and a delta.
///
/// Instructions are applied in `dest_index` order regardless of the order
/// given. Instructions that reference a missing block are skipped.
pub fn apply_instructions(
    original_blocks: &[Vec<u8>],
    instructions: &[DeltaInstruction],
    new_blocks: &HashMap<usize, Vec<u8>>,
) -> Vec<u8> {
    let mut ordered = instructions.to_vec();
    ordered.sort_by_key(|i| i.dest_index());

    let mut output = Vec::new();
    let mut skipped = 0usize;

    for instruction in &ordered {
        let block = match *instruction {
            DeltaInstruction::Copy { source_block_index, .. } => original_blocks.get(source_block_index),
            DeltaInstruction::Insert { new_block_index, .. } => new_blocks.get(&new_block_index),
        };

        match block {
            Some(block) => output.extend_from_slice(block),
            None => {
                skipped += 1;
                tracing::warn!(
                    dest_index = instruction.dest_index(),
                    instruction = ?instruction,
                    "Skipping delta instruction with invalid block reference"
                );
            }
        }
    }

    if skipped > 0 {
        tracing::warn!(skipped, "Delta applied with skipped instructions");
    }

    output
}

/// Accumulates instructions while the scan runs
struct DeltaBuilder {
    block_size: usize,
    instructions: Vec<DeltaInstruction>,
    new_blocks: HashMap<usize, Vec<u8>>,
    literal: Vec<u8>,
    reused: usize,
    delta_bytes: u64,
}

impl DeltaBuilder {
    fn new(block_size: usize) -> Self {
        Self {
            block_size,
            instructions: Vec::new(),
            new_blocks: HashMap::new(),
            literal: Vec::new(),
            reused: 0,
            delta_bytes: 0,
        }
    }

    fn copy(&mut self, source_block_index: usize) {
        self.flush();
        self.instructions.push(DeltaInstruction::Copy {
            dest_index: self.instructions.len(),
            source_block_index,
        });
        self.reused += 1;
    }

    fn literal(&mut self, bytes: &[u8]) {
        self.literal.extend_from_slice(bytes);
        while self.literal.len() >= self.block_size {
            let rest = self.literal.split_off(self.block_size);
            let block = std::mem::replace(&mut self.literal, rest);
            self.insert(block);
        }
    }

    fn flush(&mut self) {
        if !self.literal.is_empty() {
            let block = std::mem::take(&mut self.literal);
            self.insert(block);
        }
    }

    fn insert(&mut self, block: Vec<u8>) {
        let new_block_index = self.new_blocks.len();
        self.delta_bytes += block.len() as u64;
        self.new_blocks.insert(new_block_index, block);
        self.instructions.push(DeltaInstruction::Insert {
            dest_index: self.instructions.len(),
            new_block_index,
        });
    }

    fn finish(mut self, original_size: u64) -> Delta {
        self.flush();
        let stats = DeltaStats::new(
            self.instructions.len(),
            self.reused,
            original_size,
            self.delta_bytes,
        );

        Delta {
            instructions: self.instructions,
            new_blocks: self.new_blocks,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks_of(data: &[u8], block_size: usize) -> Vec<Vec<u8>> {
        data.chunks(block_size).map(|b| b.to_vec()).collect()
    }

    fn round_trip(original: &[u8], edited: &[u8], block_size: usize) -> Delta {
        let signature = FileSignature::compute(original, block_size);
        let delta = compute_delta(edited, &signature);
        let rebuilt = apply_instructions(
            &blocks_of(original, block_size),
            &delta.instructions,
            &delta.new_blocks,
        );
        assert_eq!(rebuilt, edited);
        delta
    }

    fn sample(len: usize) -> Vec<u8> {
        let mut seed = 0x2545_f491u32;
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (seed >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn test_identical_file_is_all_copies() {
        let data = sample(10_000);
        let delta = round_trip(&data, &data, 1024);

        assert!(delta.new_blocks.is_empty());
        assert_eq!(delta.stats.reused_blocks, 10);
        assert_eq!(delta.stats.savings_percent, 100.0);
    }

    #[test]
    fn test_insertion_shifts_are_found() {
        let original = sample(8192);
        let mut edited = original.clone();
        edited.splice(100..100, b"inserted bytes".iter().copied());

        // Block 0 is dirty; every later block is found at its shifted offset
        let delta = round_trip(&original, &edited, 512);
        assert_eq!(delta.stats.reused_blocks, 15);
        assert_eq!(delta.stats.delta_bytes, 512 + 14);
    }

    #[test]
    fn test_edits_deletions_and_appends() {
        let original = sample(5000);

        let mut edited = original.clone();
        edited[2048] ^= 0xff;
        round_trip(&original, &edited, 256);

        let mut edited = original.clone();
        edited.drain(300..900);
        round_trip(&original, &edited, 256);

        let mut edited = original.clone();
        edited.extend_from_slice(b"trailer");
        round_trip(&original, &edited, 256);

        round_trip(&original, b"", 256);
        round_trip(b"", &original, 256);
    }

    #[test]
    fn test_short_tail_block_is_reused() {
        let original = sample(1000);
        let delta = round_trip(&original, &original, 300);
        assert!(delta.new_blocks.is_empty());
        assert_eq!(delta.instructions.len(), 4);
    }

    #[test]
    fn test_literals_never_exceed_block_size() {
        let original = sample(4096);
        let edited: Vec<u8> = (0..5000).map(|i| (i * 7 % 13) as u8).collect();
        let delta = round_trip(&original, &edited, 512);
        assert!(delta.new_blocks.values().all(|b| b.len() <= 512));
    }

    #[test]
    fn test_weak_collision_is_not_a_match() {
        let signature = FileSignature::compute(&[0, 2, 0], 3);
        let delta = compute_delta(&[1, 0, 1], &signature);

        assert_eq!(
            delta.instructions,
            vec![DeltaInstruction::Insert { dest_index: 0, new_block_index: 0 }]
        );
        assert_eq!(delta.new_blocks[&0], vec![1, 0, 1]);
    }

    #[test]
    fn test_apply_sorts_and_skips_bad_references() {
        let original = vec![b"aa".to_vec(), b"bb".to_vec()];
        let mut new_blocks = HashMap::new();
        new_blocks.insert(0, b"NN".to_vec());

        let instructions = vec![
            DeltaInstruction::Copy { dest_index: 2, source_block_index: 0 },
            DeltaInstruction::Insert { dest_index: 0, new_block_index: 0 },
            DeltaInstruction::Copy { dest_index: 1, source_block_index: 9 },
            DeltaInstruction::Insert { dest_index: 3, new_block_index: 4 },
            DeltaInstruction::Copy { dest_index: 4, source_block_index: 1 },
        ];

        let output = apply_instructions(&original, &instructions, &new_blocks);
        assert_eq!(output, b"NNaabb");
    }
}
