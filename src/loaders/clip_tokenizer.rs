//! CLIP BPE tokenizer with runtime-added placeholder tokens

use anyhow::{anyhow, Result};
use log::debug;
use std::path::Path;
use tokenizers::{AddedToken, Tokenizer};

use crate::embeddings::{InversionError, Result as InversionResult};
use crate::models::ConceptTokenizer;

const BOS_TOKEN: &str = "<|startoftext|>";
const EOS_TOKEN: &str = "<|endoftext|>";

pub struct ClipTokenizer {
    tokenizer: Tokenizer,
    bos_id: u32,
    eos_id: u32,
    pad_id: u32,
}

impl ClipTokenizer {
    /// Load a HF `tokenizer.json`. SD 2.x pads with `!` instead of EOS.
    pub fn from_file(path: &Path, pad_token: Option<&str>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer {}: {}", path.display(), e))?;
        Self::from_tokenizer(tokenizer, pad_token)
    }

    pub fn from_tokenizer(tokenizer: Tokenizer, pad_token: Option<&str>) -> Result<Self> {
        let lookup = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer has no {} token", token))
        };
        let bos_id = lookup(BOS_TOKEN)?;
        let eos_id = lookup(EOS_TOKEN)?;
        let pad_id = match pad_token {
            Some(token) => lookup(token)?,
            None => eos_id,
        };

        Ok(Self {
            tokenizer,
            bos_id,
            eos_id,
            pad_id,
        })
    }

    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

impl ConceptTokenizer for ClipTokenizer {
    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    fn encode(&self, text: &str) -> InversionResult<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| InversionError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn encode_padded(&self, text: &str, max_length: usize) -> InversionResult<Vec<u32>> {
        if max_length < 2 {
            return Err(InversionError::Tokenizer(format!(
                "max_length {} leaves no room for BOS and EOS",
                max_length
            )));
        }
        let mut body = self.encode(text)?;
        body.truncate(max_length - 2);

        let mut ids = Vec::with_capacity(max_length);
        ids.push(self.bos_id);
        ids.extend(body);
        ids.push(self.eos_id);
        ids.resize(max_length, self.pad_id);
        Ok(ids)
    }

    fn add_tokens(&mut self, tokens: &[String]) -> usize {
        let added: Vec<AddedToken> = tokens
            .iter()
            .map(|t| AddedToken::from(t.clone(), false))
            .collect();
        let count = self.tokenizer.add_tokens(&added);
        debug!("Added {} of {} tokens to tokenizer", count, tokens.len());
        count
    }
}
