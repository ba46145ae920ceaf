//! Result reordering: maximal marginal relevance, source diversity and rank fusion.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::retriever::RetrievedChunk;

const RRF_CODE_KEY_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankConfig {
    /// 1.0 ranks purely by relevance, 0.0 purely by dissimilarity.
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: usize,
}

fn default_mmr_lambda() -> f32 {
    0.5
}

fn default_rrf_k() -> usize {
    60
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            mmr_lambda: default_mmr_lambda(),
            rrf_k: default_rrf_k(),
        }
    }
}

fn by_similarity_desc(chunks: &mut [RetrievedChunk]) {
    chunks.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
}

fn char_set(text: &str) -> HashSet<char> {
    text.chars().flat_map(char::to_lowercase).collect()
}

/// Character-set Jaccard similarity of two lowercase texts.
#[must_use]
pub fn text_similarity(a: &str, b: &str) -> f32 {
    jaccard(&char_set(a), &char_set(b))
}

#[allow(clippy::cast_precision_loss)]
fn jaccard(a: &HashSet<char>, b: &HashSet<char>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    dot / (na * nb + 1e-8)
}

/// Greedy MMR selection over precomputed relevance and pairwise similarity.
///
/// `first` is the index selected up front. Ties keep the earliest candidate.
fn mmr_select(
    n: usize,
    k: usize,
    first: usize,
    lambda: f32,
    relevance: impl Fn(usize) -> f32,
    similarity: impl Fn(usize, usize) -> f32,
) -> Vec<usize> {
    let mut selected = vec![first];
    let mut remaining: Vec<usize> = (0..n).filter(|&i| i != first).collect();

    while selected.len() < k && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (pos, &candidate) in remaining.iter().enumerate() {
            let max_sim = selected
                .iter()
                .map(|&s| similarity(candidate, s))
                .fold(f32::NEG_INFINITY, f32::max);
            let score = lambda * relevance(candidate) - (1.0 - lambda) * max_sim;
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }
        selected.push(remaining.remove(best_pos));
    }
    selected
}

fn take_in_order(chunks: Vec<RetrievedChunk>, order: &[usize]) -> Vec<RetrievedChunk> {
    let mut slots: Vec<Option<RetrievedChunk>> = chunks.into_iter().map(Some).collect();
    order
        .iter()
        .filter_map(|&i| slots.get_mut(i).and_then(Option::take))
        .enumerate()
        .map(|(rank, mut chunk)| {
            chunk.mmr_rank = Some(rank + 1);
            chunk
        })
        .collect()
}

/// Maximal marginal relevance using retrieval similarity as relevance and
/// character-set Jaccard between candidates as redundancy.
///
/// Returns `min(k, chunks.len())` chunks; with `lambda = 1` the order is
/// descending similarity, ties in input order.
#[must_use]
pub fn mmr(mut chunks: Vec<RetrievedChunk>, lambda: f32, k: usize) -> Vec<RetrievedChunk> {
    if chunks.is_empty() || k == 0 {
        return Vec::new();
    }
    by_similarity_desc(&mut chunks);

    let sets: Vec<HashSet<char>> = chunks.iter().map(|c| char_set(&c.code)).collect();
    let relevance: Vec<f32> = chunks.iter().map(|c| c.similarity).collect();
    let order = mmr_select(
        chunks.len(),
        k,
        0,
        lambda,
        |i| relevance[i],
        |a, b| jaccard(&sets[a], &sets[b]),
    );
    take_in_order(chunks, &order)
}

/// MMR with cosine relevance against `query` and cosine redundancy between
/// candidate `vectors`. Falls back to [`mmr`] when the vectors do not line up.
#[must_use]
pub fn mmr_with_vectors(
    chunks: Vec<RetrievedChunk>,
    query: &[f32],
    vectors: &[Vec<f32>],
    lambda: f32,
    k: usize,
) -> Vec<RetrievedChunk> {
    if chunks.is_empty() || k == 0 {
        return Vec::new();
    }
    if vectors.len() != chunks.len() {
        tracing::warn!(
            chunks = chunks.len(),
            vectors = vectors.len(),
            "vector count mismatch, using similarity-based MMR"
        );
        return mmr(chunks, lambda, k);
    }

    let relevance: Vec<f32> = vectors.iter().map(|v| cosine(query, v)).collect();
    let first = relevance
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &r)| {
            if r > best.1 { (i, r) } else { best }
        })
        .0;
    let order = mmr_select(
        chunks.len(),
        k,
        first,
        lambda,
        |i| relevance[i],
        |a, b| cosine(&vectors[a], &vectors[b]),
    );
    take_in_order(chunks, &order)
}

/// Spread results across sources: best chunk of each file first, then unseen
/// `(file, chunk_type)` pairs, then the most similar leftovers.
#[must_use]
pub fn diversity_rerank(mut chunks: Vec<RetrievedChunk>, k: usize) -> Vec<RetrievedChunk> {
    if chunks.is_empty() || k == 0 {
        return Vec::new();
    }
    by_similarity_desc(&mut chunks);

    let mut taken = vec![false; chunks.len()];
    let mut order = Vec::with_capacity(k.min(chunks.len()));

    let mut files: HashSet<&str> = HashSet::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if order.len() >= k {
            break;
        }
        if files.insert(chunk.file_path.as_str()) {
            taken[i] = true;
            order.push(i);
        }
    }

    let mut pairs: HashSet<(&str, &str)> = order
        .iter()
        .map(|&i| (chunks[i].file_path.as_str(), chunks[i].chunk_type.as_str()))
        .collect();
    for (i, chunk) in chunks.iter().enumerate() {
        if order.len() >= k {
            break;
        }
        if !taken[i] && pairs.insert((chunk.file_path.as_str(), chunk.chunk_type.as_str())) {
            taken[i] = true;
            order.push(i);
        }
    }

    for (i, taken) in taken.iter_mut().enumerate() {
        if order.len() >= k {
            break;
        }
        if !*taken {
            *taken = true;
            order.push(i);
        }
    }

    tracing::debug!(selected = order.len(), files = files.len(), "diversity rerank");
    let mut slots: Vec<Option<RetrievedChunk>> = chunks.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

fn fusion_key(chunk: &RetrievedChunk) -> String {
    if chunk.id.is_empty() {
        chunk.code.chars().take(RRF_CODE_KEY_CHARS).collect()
    } else {
        chunk.id.clone()
    }
}

/// Reciprocal rank fusion: each chunk scores `Σ 1 / (rrf_k + rank + 1)` over
/// the lists it appears in (rank 0-based). Duplicates are merged by id, or by
/// the first 50 characters of code for chunks without one.
#[must_use]
pub fn reciprocal_rank_fusion(
    lists: &[Vec<RetrievedChunk>],
    rrf_k: usize,
    top_k: Option<usize>,
) -> Vec<RetrievedChunk> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut fused: Vec<(RetrievedChunk, f32)> = Vec::new();

    for list in lists {
        for (rank, chunk) in list.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let contribution = 1.0 / (rrf_k + rank + 1) as f32;
            let key = fusion_key(chunk);
            if let Some(&pos) = index.get(&key) {
                fused[pos].1 += contribution;
            } else {
                index.insert(key, fused.len());
                fused.push((chunk.clone(), contribution));
            }
        }
    }

    fused.sort_by(|a, b| b.1.total_cmp(&a.1));
    let limit = top_k.unwrap_or(fused.len());
    fused
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, (mut chunk, score))| {
            chunk.rrf_score = Some(score);
            chunk.rrf_rank = Some(i + 1);
            chunk
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(id: &str, file: &str, kind: &str, sim: f32, code: &str) -> RetrievedChunk {
        RetrievedChunk::sample(id, file, kind, sim, code)
    }

    fn ids(chunks: &[RetrievedChunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn jaccard_basics() {
        assert!((text_similarity("abc", "ABC") - 1.0).abs() < 1e-6);
        assert!(text_similarity("abc", "xyz").abs() < 1e-6);
        assert!(text_similarity("", "").abs() < 1e-6);
        assert!((text_similarity("ab", "bc") - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn mmr_lambda_one_is_similarity_order() {
        let chunks = vec![
            c("a", "a.py", "function", 0.2, "aaa"),
            c("b", "b.py", "function", 0.9, "bbb"),
            c("c", "c.py", "function", 0.5, "ccc"),
        ];
        let out = mmr(chunks, 1.0, 3);
        assert_eq!(ids(&out), vec!["b", "c", "a"]);
        assert_eq!(out[0].mmr_rank, Some(1));
        assert_eq!(out[2].mmr_rank, Some(3));
    }

    #[test]
    fn mmr_penalises_duplicates() {
        let chunks = vec![
            c("top", "a.py", "function", 0.90, "def load(path): return read(path)"),
            c("dup", "a.py", "function", 0.89, "def load(path): return read(path)"),
            c("other", "b.py", "function", 0.60, "XYZ 123 !!"),
        ];
        let out = mmr(chunks, 0.5, 2);
        assert_eq!(ids(&out), vec!["top", "other"]);
    }

    #[test]
    fn mmr_empty_and_zero_k() {
        assert!(mmr(Vec::new(), 0.5, 3).is_empty());
        assert!(mmr(vec![c("a", "a", "f", 0.5, "x")], 0.5, 0).is_empty());
    }

    #[test]
    fn mmr_vectors_prefers_dissimilar() {
        let chunks = vec![
            c("a", "a.py", "function", 0.0, "a"),
            c("b", "b.py", "function", 0.0, "b"),
            c("c", "c.py", "function", 0.0, "c"),
        ];
        let query = vec![1.0, 0.0];
        let vectors = vec![vec![1.0, 0.0], vec![0.99, 0.1], vec![0.6, 0.8]];
        let out = mmr_with_vectors(chunks, &query, &vectors, 0.3, 2);
        assert_eq!(ids(&out), vec!["a", "c"]);
    }

    #[test]
    fn mmr_vectors_length_mismatch_falls_back() {
        let chunks = vec![
            c("a", "a.py", "function", 0.1, "aaa"),
            c("b", "b.py", "function", 0.9, "bbb"),
        ];
        let out = mmr_with_vectors(chunks, &[1.0], &[vec![1.0]], 1.0, 2);
        assert_eq!(ids(&out), vec!["b", "a"]);
    }

    #[test]
    fn diversity_one_per_file_first() {
        let chunks = vec![
            c("a1", "a.py", "function", 0.9, "x"),
            c("a2", "a.py", "function", 0.8, "x"),
            c("a3", "a.py", "class", 0.7, "x"),
            c("b1", "b.py", "function", 0.6, "x"),
            c("c1", "c.py", "function", 0.5, "x"),
        ];
        let out = diversity_rerank(chunks, 4);
        assert_eq!(ids(&out), vec!["a1", "b1", "c1", "a3"]);
    }

    #[test]
    fn diversity_backfills_leftovers() {
        let chunks = vec![
            c("a1", "a.py", "function", 0.9, "x"),
            c("a2", "a.py", "function", 0.8, "x"),
            c("a3", "a.py", "function", 0.7, "x"),
        ];
        let out = diversity_rerank(chunks, 5);
        assert_eq!(ids(&out), vec!["a1", "a2", "a3"]);
    }

    #[test]
    fn rrf_sums_across_lists() {
        let l1 = vec![c("x", "f", "t", 0.0, ""), c("y", "f", "t", 0.0, "")];
        let l2 = vec![c("y", "f", "t", 0.0, ""), c("z", "f", "t", 0.0, "")];
        let out = reciprocal_rank_fusion(&[l1, l2], 60, None);
        assert_eq!(ids(&out), vec!["y", "x", "z"]);
        let y = out[0].rrf_score.unwrap();
        assert!((y - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-6);
        assert_eq!(out[0].rrf_rank, Some(1));
    }

    #[test]
    fn rrf_dedupes_by_code_prefix_without_id() {
        let long = "z".repeat(80);
        let l1 = vec![c("", "f", "t", 0.0, &long)];
        let l2 = vec![c("", "f", "t", 0.0, &format!("{}tail", &long[..50]))];
        let out = reciprocal_rank_fusion(&[l1, l2], 60, None);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn rrf_top_k_and_empty() {
        assert!(reciprocal_rank_fusion(&[], 60, None).is_empty());
        let l = vec![c("a", "f", "t", 0.0, ""), c("b", "f", "t", 0.0, "")];
        assert_eq!(reciprocal_rank_fusion(&[l], 60, Some(1)).len(), 1);
    }

    mod properties {
        use proptest::prelude::*;

        use super::super::*;

        fn arb_chunks() -> impl Strategy<Value = Vec<RetrievedChunk>> {
            prop::collection::vec((0u8..6, 0.0f32..1.0, "[a-f ]{0,12}"), 0..20).prop_map(|rows| {
                rows.into_iter()
                    .enumerate()
                    .map(|(i, (file, sim, code))| {
                        RetrievedChunk::sample(
                            &format!("c{i}"),
                            &format!("f{file}.py"),
                            "function",
                            sim,
                            &code,
                        )
                    })
                    .collect()
            })
        }

        proptest! {
            #[test]
            fn mmr_returns_min_k_len(chunks in arb_chunks(), k in 0usize..25, lambda in 0.0f32..=1.0) {
                let expected = k.min(chunks.len());
                let out = mmr(chunks, lambda, k);
                prop_assert_eq!(out.len(), expected);
                let unique: HashSet<_> = out.iter().map(|c| c.id.clone()).collect();
                prop_assert_eq!(unique.len(), expected);
            }

            #[test]
            fn mmr_lambda_one_sorts(chunks in arb_chunks()) {
                let mut expected = chunks.clone();
                expected.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
                let out = mmr(chunks.clone(), 1.0, chunks.len());
                let got: Vec<_> = out.iter().map(|c| c.id.clone()).collect();
                let want: Vec<_> = expected.iter().map(|c| c.id.clone()).collect();
                prop_assert_eq!(got, want);
            }

            #[test]
            fn diversity_covers_distinct_files(chunks in arb_chunks(), k in 1usize..8) {
                let files: HashSet<_> = chunks.iter().map(|c| c.file_path.clone()).collect();
                prop_assume!(files.len() >= k);
                let out = diversity_rerank(chunks, k);
                let first: HashSet<_> = out.iter().take(k).map(|c| c.file_path.clone()).collect();
                prop_assert_eq!(first.len(), k);
            }

            #[test]
            fn rrf_unanimous_winner_first(lists in prop::collection::vec(arb_chunks(), 1..4)) {
                let winner = RetrievedChunk::sample("winner", "w.py", "function", 0.5, "w");
                let lists: Vec<Vec<RetrievedChunk>> = lists
                    .into_iter()
                    .map(|mut l| {
                        l.insert(0, winner.clone());
                        l
                    })
                    .collect();
                let out = reciprocal_rank_fusion(&lists, 60, None);
                prop_assert_eq!(out[0].id.as_str(), "winner");
                let top = out[0].rrf_score.unwrap_or_default();
                prop_assert!(out.iter().all(|c| c.rrf_score.unwrap_or_default() <= top));
            }
        }
    }
}
