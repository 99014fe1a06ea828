//! Corpus encoding and random-window batching.

use crate::error::TokenizerError;
use crate::prng::Prng;
use crate::tokenizer::CharTokenizer;

/// Encode each non-empty trimmed line as `BOS line EOS` and concatenate.
pub fn encode_corpus(tok: &CharTokenizer, corpus: &str) -> Result<Vec<usize>, TokenizerError> {
    let mut out = Vec::with_capacity(corpus.len() + 2);
    for line in corpus.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let ids = tok.encode(line)?;
        out.push(tok.bos_id());
        out.extend(ids);
        out.push(tok.eos_id());
    }
    Ok(out)
}

/// One batch: `batch` rows of `seq` ids, flattened row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub batch: usize,
    pub seq: usize,
    pub inputs: Vec<usize>,
    pub targets: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct DataLoader {
    data: Vec<usize>,
    seq_len: usize,
    batch_size: usize,
}

impl DataLoader {
    pub fn new(data: Vec<usize>, seq_len: usize, batch_size: usize) -> Self {
        Self {
            data,
            seq_len: seq_len.max(1),
            batch_size: batch_size.max(1),
        }
    }

    pub fn len_tokens(&self) -> usize {
        self.data.len()
    }

    /// `max(1, (n - 1) / (batch * seq))`
    pub fn num_batches(&self) -> usize {
        let usable = self.data.len().saturating_sub(1);
        (usable / (self.batch_size * self.seq_len)).max(1)
    }

    /// Random windows: `x = data[p..p+T]`, `y = data[p+1..p+T+1]`.
    ///
    /// A corpus shorter than `T + 1` fills every row with its usable prefix
    /// and pads the rest with id 0.
    pub fn next_batch(&self, rng: &mut Prng) -> Batch {
        let (b, t) = (self.batch_size, self.seq_len);
        let n = self.data.len();
        let mut inputs = vec![0; b * t];
        let mut targets = vec![0; b * t];

        if n < t + 1 {
            let usable = n.saturating_sub(1);
            for row in 0..b {
                let o = row * t;
                inputs[o..o + usable].copy_from_slice(&self.data[..usable]);
                targets[o..o + usable].copy_from_slice(&self.data[1..=usable]);
            }
        } else {
            for row in 0..b {
                let p = rng.gen_range_usize(0, n - t);
                let o = row * t;
                inputs[o..o + t].copy_from_slice(&self.data[p..p + t]);
                targets[o..o + t].copy_from_slice(&self.data[p + 1..p + t + 1]);
            }
        }

        Batch {
            batch: b,
            seq: t,
            inputs,
            targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_wrapped_in_specials() {
        let tok = CharTokenizer::from_corpus("ab\nb").expect("tokenizer");
        let ids = encode_corpus(&tok, "ab\n\n  b \n").expect("encode");
        let (bos, eos) = (tok.bos_id(), tok.eos_id());
        assert_eq!(ids, vec![bos, 1, 2, eos, bos, 2, eos]);
    }

    #[test]
    fn targets_are_inputs_shifted_by_one() {
        let data: Vec<usize> = (0..50).collect();
        let dl = DataLoader::new(data, 8, 3);
        let b = dl.next_batch(&mut Prng::new(9));
        for row in 0..3 {
            for i in 0..8 {
                assert_eq!(b.targets[row * 8 + i], b.inputs[row * 8 + i] + 1);
            }
        }
    }

    #[test]
    fn short_corpus_uses_prefix_and_pads() {
        let dl = DataLoader::new(vec![5, 6, 7], 6, 2);
        let b = dl.next_batch(&mut Prng::new(1));
        assert_eq!(&b.inputs[..6], &[5, 6, 0, 0, 0, 0]);
        assert_eq!(&b.targets[6..], &[6, 7, 0, 0, 0, 0]);
    }

    #[test]
    fn num_batches_never_drops_below_one() {
        assert_eq!(DataLoader::new(vec![1; 3], 8, 4).num_batches(), 1);
        assert_eq!(DataLoader::new(vec![1; 65], 8, 4).num_batches(), 2);
    }
}
