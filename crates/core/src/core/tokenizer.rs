//! Character tokenizer with two reserved ids at the top of the vocabulary:
//! BOS is `vocab_size - 2`, EOS is `vocab_size - 1`.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::error::TokenizerError;

pub const BOS_TOKEN: &str = "<BOS>";
pub const EOS_TOKEN: &str = "<EOS>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerType {
    #[default]
    Character,
}

/// Exported vocabulary, `{"type":"character","vocab":{..},"has_special_tokens":true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabJson {
    #[serde(rename = "type")]
    pub kind: String,
    pub vocab: HashMap<String, usize>,
    #[serde(default = "yes")]
    pub has_special_tokens: bool,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct CharTokenizer {
    chars: Vec<char>,
    index: HashMap<char, usize>,
}

impl CharTokenizer {
    /// Vocabulary is the sorted set of distinct characters in `corpus`.
    pub fn from_corpus(corpus: &str) -> Result<Self, TokenizerError> {
        let mut chars: Vec<char> = corpus.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        Self::from_chars(chars)
    }

    fn from_chars(chars: Vec<char>) -> Result<Self, TokenizerError> {
        if chars.is_empty() {
            return Err(TokenizerError::EmptyCorpus);
        }
        let index = chars.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        Ok(Self { chars, index })
    }

    pub fn from_vocab_json(v: &VocabJson) -> Result<Self, TokenizerError> {
        if v.kind != "character" {
            return Err(TokenizerError::UnsupportedType(v.kind.clone()));
        }
        let mut slots: Vec<Option<char>> = vec![None; v.vocab.len()];
        for (sym, &id) in &v.vocab {
            let mut it = sym.chars();
            let (Some(c), None) = (it.next(), it.next()) else {
                return Err(TokenizerError::InvalidVocab(format!(
                    "entry {sym:?} is not a single character"
                )));
            };
            match slots.get_mut(id) {
                Some(slot) if slot.is_none() => *slot = Some(c),
                _ => {
                    return Err(TokenizerError::InvalidVocab(format!(
                        "id {id} is out of range or duplicated"
                    )))
                }
            }
        }
        let chars = slots.into_iter().flatten().collect();
        Self::from_chars(chars)
    }

    pub fn to_vocab_json(&self) -> VocabJson {
        VocabJson {
            kind: "character".to_string(),
            vocab: self
                .chars
                .iter()
                .enumerate()
                .map(|(i, c)| (c.to_string(), i))
                .collect(),
            has_special_tokens: true,
        }
    }

    /// Includes BOS and EOS.
    pub fn vocab_size(&self) -> usize {
        self.chars.len() + 2
    }

    pub fn bos_id(&self) -> usize {
        self.vocab_size() - 2
    }

    pub fn eos_id(&self) -> usize {
        self.vocab_size() - 1
    }

    pub fn is_special(&self, id: usize) -> bool {
        id == self.bos_id() || id == self.eos_id()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<usize>, TokenizerError> {
        text.chars()
            .map(|c| {
                self.index
                    .get(&c)
                    .copied()
                    .ok_or(TokenizerError::UnknownSymbol(c))
            })
            .collect()
    }

    /// BOS, EOS and out-of-range ids are dropped.
    pub fn decode(&self, ids: &[usize]) -> String {
        ids.iter().filter_map(|&i| self.chars.get(i)).collect()
    }

    /// Printable label for one id, naming the special tokens.
    pub fn label(&self, id: usize) -> String {
        if id == self.bos_id() {
            BOS_TOKEN.to_string()
        } else if id == self.eos_id() {
            EOS_TOKEN.to_string()
        } else {
            self.decode(&[id])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sorted_and_specials_sit_on_top() {
        let t = CharTokenizer::from_corpus("cab a").expect("tokenizer");
        assert_eq!(t.vocab_size(), 4 + 2);
        assert_eq!(t.encode(" abc").expect("encode"), vec![0, 1, 2, 3]);
        assert_eq!(t.bos_id(), 4);
        assert_eq!(t.eos_id(), 5);
    }

    #[test]
    fn decode_drops_specials() {
        let t = CharTokenizer::from_corpus("hi").expect("tokenizer");
        let ids = [t.bos_id(), 0, 1, t.eos_id()];
        assert_eq!(t.decode(&ids), "hi");
        assert_eq!(t.label(t.eos_id()), EOS_TOKEN);
    }

    #[test]
    fn unknown_symbol_is_an_error() {
        let t = CharTokenizer::from_corpus("abc").expect("tokenizer");
        assert!(matches!(
            t.encode("abz"),
            Err(TokenizerError::UnknownSymbol('z'))
        ));
    }

    #[test]
    fn empty_corpus_is_rejected() {
        assert!(matches!(
            CharTokenizer::from_corpus(""),
            Err(TokenizerError::EmptyCorpus)
        ));
    }

    #[test]
    fn vocab_json_rebuilds_the_same_tokenizer() {
        let t = CharTokenizer::from_corpus("hello world").expect("tokenizer");
        let json = serde_json::to_string(&t.to_vocab_json()).expect("serialize");
        assert!(json.contains("\"type\":\"character\""));
        let v: VocabJson = serde_json::from_str(&json).expect("parse");
        let back = CharTokenizer::from_vocab_json(&v).expect("rebuild");
        assert_eq!(back.encode("world").ok(), t.encode("world").ok());
        assert_eq!(back.vocab_size(), t.vocab_size());
    }
}
