//! Placeholder token registration and embedding row initialization

use candle_core::{IndexOp, Tensor, Var};
use log::{info, warn};
use rand::rngs::StdRng;
use std::ops::Range;

use super::error::{InversionError, Result};
use crate::models::{ConceptTokenizer, TextEncoder};

/// `prefix`, `prefix1`, ..., `prefix{K-1}`
pub fn concept_token_strings(token_string: &str, num_vectors: usize) -> Vec<String> {
    std::iter::once(token_string.to_string())
        .chain((1..num_vectors).map(|i| format!("{}{}", token_string, i)))
        .collect()
}

/// The K placeholder tokens and the contiguous id block they occupy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptTokens {
    strings: Vec<String>,
    ids: Vec<u32>,
}

impl ConceptTokens {
    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// First id of the trainable block
    pub fn base_id(&self) -> u32 {
        self.ids[0]
    }

    /// Row range of the trainable block in the embedding table
    pub fn rows(&self) -> Range<usize> {
        let base = self.base_id() as usize;
        base..base + self.ids.len()
    }

    /// Token strings joined with single spaces, as they appear in captions
    pub fn joined(&self) -> String {
        self.strings.join(" ")
    }
}

/// How the new rows are seeded after the resize
#[derive(Debug, Clone, Default)]
pub struct EmbeddingInit {
    /// Base-vocabulary ids whose rows are copied cyclically
    pub init_token_ids: Option<Vec<u32>>,
    /// `[K, D]` rows applied after the init word
    pub weights: Option<Tensor>,
}

impl EmbeddingInit {
    /// Encode `init_word` with the tokenizer as it is before registration
    pub fn from_init_word<T: ConceptTokenizer + ?Sized>(
        tokenizer: &T,
        init_word: Option<&str>,
        num_vectors: usize,
    ) -> Result<Self> {
        let init_token_ids = match init_word {
            Some(word) => {
                let ids = tokenizer.encode(word)?;
                if ids.is_empty() {
                    return Err(InversionError::EmptyInitWord(word.to_string()));
                }
                if ids.len() > 1 && ids.len() != num_vectors {
                    warn!(
                        "init word {:?} has {} tokens but num_vectors_per_token is {}, init tokens are repeated or truncated",
                        word,
                        ids.len(),
                        num_vectors
                    );
                }
                Some(ids)
            }
            None => None,
        };

        Ok(Self {
            init_token_ids,
            weights: None,
        })
    }

    pub fn with_weights(mut self, weights: Tensor) -> Self {
        self.weights = Some(weights);
        self
    }
}

/// Adds the K placeholder strings to the tokenizer and grows the text
/// encoder's token table to the new vocabulary size. The vocabulary is left
/// untouched when any string is already present.
pub fn register_concept_tokens<T, E>(
    tokenizer: &mut T,
    text_encoder: &mut E,
    token_string: &str,
    num_vectors: usize,
    rng: &mut StdRng,
) -> Result<ConceptTokens>
where
    T: ConceptTokenizer + ?Sized,
    E: TextEncoder + ?Sized,
{
    if num_vectors == 0 {
        return Err(InversionError::InvalidVectorCount(num_vectors));
    }

    let strings = concept_token_strings(token_string, num_vectors);
    let conflicts: Vec<String> = strings
        .iter()
        .filter(|s| tokenizer.token_to_id(s).is_some())
        .cloned()
        .collect();
    if !conflicts.is_empty() {
        return Err(InversionError::TokenConflict(conflicts));
    }

    let old_vocab_size = tokenizer.vocab_size();
    let added = tokenizer.add_tokens(&strings);
    if added != num_vectors {
        return Err(InversionError::TokenCount {
            expected: num_vectors,
            added,
        });
    }

    let ids = strings
        .iter()
        .map(|s| {
            tokenizer
                .token_to_id(s)
                .ok_or_else(|| InversionError::Tokenizer(format!("added token {:?} has no id", s)))
        })
        .collect::<Result<Vec<u32>>>()?;

    let vocab_size = tokenizer.vocab_size();
    let expected: Vec<u32> = (old_vocab_size as u32..(old_vocab_size + num_vectors) as u32).collect();
    if ids != expected || vocab_size != old_vocab_size + num_vectors {
        return Err(InversionError::NonContiguousTokenIds { ids, vocab_size });
    }
    info!("tokens are added: {:?}", ids);

    text_encoder.resize_token_embeddings(vocab_size, rng)?;
    let rows = text_encoder.token_embedding().as_tensor().dim(0)?;
    if rows != vocab_size {
        return Err(InversionError::ShapeMismatch {
            context: "resized token embedding".to_string(),
            expected: vec![vocab_size, text_encoder.embed_dim()],
            found: text_encoder.token_embedding().as_tensor().dims().to_vec(),
        });
    }

    Ok(ConceptTokens { strings, ids })
}

/// Seeds the trainable rows from the init word and then the weights file.
/// With neither, the rows keep the values drawn by the resize.
pub fn initialize_concept_embeddings<E: TextEncoder + ?Sized>(
    text_encoder: &E,
    tokens: &ConceptTokens,
    init: &EmbeddingInit,
) -> Result<()> {
    let var = text_encoder.token_embedding();

    if let Some(init_ids) = &init.init_token_ids {
        let source: Vec<u32> = (0..tokens.len())
            .map(|i| init_ids[i % init_ids.len()])
            .collect();
        let table = var.as_detached_tensor();
        let index = Tensor::new(source.as_slice(), table.device())?;
        let rows = table.index_select(&index, 0)?;
        write_rows(var, tokens.rows(), &rows)?;
    }

    if let Some(weights) = &init.weights {
        let table = var.as_detached_tensor();
        let expected = vec![tokens.len(), table.dim(1)?];
        if weights.dims() != expected.as_slice() {
            return Err(InversionError::ShapeMismatch {
                context: "num_vectors_per_token and loaded weights".to_string(),
                expected,
                found: weights.dims().to_vec(),
            });
        }
        let rows = weights.to_device(table.device())?.to_dtype(table.dtype())?;
        write_rows(var, tokens.rows(), &rows)?;
        info!("weights loaded for {} tokens", tokens.len());
    }

    Ok(())
}

/// Replace `rows` of the table held by `var` with `values`
pub(crate) fn write_rows(var: &Var, rows: Range<usize>, values: &Tensor) -> Result<()> {
    let table = var.as_detached_tensor();
    let (vocab_size, _) = table.dims2()?;

    let mut parts = Vec::with_capacity(3);
    if rows.start > 0 {
        parts.push(table.i(0..rows.start)?);
    }
    parts.push(values.clone());
    if rows.end < vocab_size {
        parts.push(table.i(rows.end..vocab_size)?);
    }
    var.set(&Tensor::cat(&parts, 0)?)?;
    Ok(())
}

/// Current values of the trainable rows
pub fn extract_rows(var: &Var, tokens: &ConceptTokens) -> Result<Tensor> {
    Ok(var.as_detached_tensor().i(tokens.rows())?.copy()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{tiny_clip, tiny_tokenizer, TINY_VOCAB};
    use candle_core::Device;
    use rand::SeedableRng;

    #[test]
    fn test_token_strings() {
        assert_eq!(concept_token_strings("sks", 1), vec!["sks"]);
        assert_eq!(concept_token_strings("sks", 3), vec!["sks", "sks1", "sks2"]);
    }

    #[test]
    fn test_register_ids_follow_vocabulary() {
        for k in 1..=4 {
            let mut rng = StdRng::seed_from_u64(1);
            let mut tokenizer = tiny_tokenizer();
            let mut encoder = tiny_clip(TINY_VOCAB, &mut rng);
            let v = tokenizer.vocab_size() as u32;

            let tokens =
                register_concept_tokens(&mut tokenizer, &mut encoder, "zwx", k, &mut rng).unwrap();

            let expected: Vec<u32> = (v..v + k as u32).collect();
            assert_eq!(tokens.ids(), expected.as_slice());
            assert_eq!(tokens.rows(), v as usize..v as usize + k);
            assert_eq!(encoder.token_embedding().as_tensor().dim(0).unwrap(), v as usize + k);
        }
    }

    #[test]
    fn test_register_conflict_leaves_vocabulary() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut tokenizer = tiny_tokenizer();
        let mut encoder = tiny_clip(TINY_VOCAB, &mut rng);
        let before = tokenizer.vocab_size();

        let err = register_concept_tokens(&mut tokenizer, &mut encoder, "cat", 2, &mut rng)
            .unwrap_err();

        assert!(matches!(err, InversionError::TokenConflict(ref s) if s == &vec!["cat".to_string()]));
        assert_eq!(tokenizer.vocab_size(), before);
        assert!(tokenizer.token_to_id("cat1").is_none());
        assert_eq!(encoder.token_embedding().as_tensor().dim(0).unwrap(), before);
    }

    #[test]
    fn test_register_rejects_zero_vectors() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut tokenizer = tiny_tokenizer();
        let mut encoder = tiny_clip(TINY_VOCAB, &mut rng);

        let err = register_concept_tokens(&mut tokenizer, &mut encoder, "zwx", 0, &mut rng)
            .unwrap_err();
        assert!(matches!(err, InversionError::InvalidVectorCount(0)));
    }

    #[test]
    fn test_init_word_rows_cycle() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut tokenizer = tiny_tokenizer();
        let mut encoder = tiny_clip(TINY_VOCAB, &mut rng);
        let init = EmbeddingInit::from_init_word(&tokenizer, Some("cat dog"), 5).unwrap();
        let init_ids = init.init_token_ids.clone().unwrap();
        assert_eq!(init_ids.len(), 2);

        let tokens =
            register_concept_tokens(&mut tokenizer, &mut encoder, "zwx", 5, &mut rng).unwrap();
        initialize_concept_embeddings(&encoder, &tokens, &init).unwrap();

        let table = encoder.token_embedding().as_tensor().to_vec2::<f32>().unwrap();
        for (i, &id) in tokens.ids().iter().enumerate() {
            assert_eq!(table[id as usize], table[init_ids[i % 2] as usize]);
        }
    }

    #[test]
    fn test_weights_override_and_count_mismatch() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut tokenizer = tiny_tokenizer();
        let mut encoder = tiny_clip(TINY_VOCAB, &mut rng);
        let tokens =
            register_concept_tokens(&mut tokenizer, &mut encoder, "zwx", 2, &mut rng).unwrap();
        let dim = encoder.embed_dim();

        let weights = Tensor::ones((2, dim), candle_core::DType::F32, &Device::Cpu).unwrap();
        let init = EmbeddingInit::default().with_weights(weights);
        initialize_concept_embeddings(&encoder, &tokens, &init).unwrap();
        let rows = extract_rows(encoder.token_embedding(), &tokens).unwrap();
        assert_eq!(rows.to_vec2::<f32>().unwrap(), vec![vec![1.0; dim]; 2]);

        let wrong = Tensor::ones((3, dim), candle_core::DType::F32, &Device::Cpu).unwrap();
        let init = EmbeddingInit::default().with_weights(wrong);
        let err = initialize_concept_embeddings(&encoder, &tokens, &init).unwrap_err();
        assert!(matches!(err, InversionError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_default_init_is_seeded() {
        let build = || {
            let mut rng = StdRng::seed_from_u64(11);
            let mut tokenizer = tiny_tokenizer();
            let mut encoder = tiny_clip(TINY_VOCAB, &mut rng);
            let tokens =
                register_concept_tokens(&mut tokenizer, &mut encoder, "zwx", 2, &mut rng).unwrap();
            extract_rows(encoder.token_embedding(), &tokens)
                .unwrap()
                .to_vec2::<f32>()
                .unwrap()
        };

        assert_eq!(build(), build());
    }
}
