//! Fixed-size blocking of a chunked stream

/// Re-blocks a sequence of chunks into fixed-size blocks.
///
/// Chunk boundaries are invisible in the output: bytes left over at the end
/// of one chunk are carried into the next block.
#[derive(Debug)]
pub struct BlockSplitter {
    block_size: usize,
    pending: Vec<u8>,
    blocks: Vec<Vec<u8>>,
}

impl BlockSplitter {
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size),
            blocks: Vec::new(),
        }
    }

    /// Feed the next chunk of the stream
    pub fn push(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.block_size - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.pending.len() == self.block_size {
                let block = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_size));
                self.blocks.push(block);
            }
        }
    }

    /// All blocks, the last one possibly short
    pub fn finish(mut self) -> Vec<Vec<u8>> {
        if !self.pending.is_empty() {
            self.blocks.push(self.pending);
        }
        self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_span_chunk_boundaries() {
        let mut splitter = BlockSplitter::new(4);
        splitter.push(b"abc");
        splitter.push(b"defgh");
        splitter.push(b"");
        splitter.push(b"ij");

        let blocks = splitter.finish();
        assert_eq!(blocks, vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]);
    }

    #[test]
    fn test_exact_multiple_has_no_short_block() {
        let mut splitter = BlockSplitter::new(3);
        splitter.push(b"abcdef");
        assert_eq!(splitter.finish().len(), 2);
        assert!(BlockSplitter::new(3).finish().is_empty());
    }
}
