use std::collections::BTreeMap;
use once_cell::sync::Lazy;
use regex::Regex;

/// The embedded merge table defining the fixed estimator vocabulary
const MERGES_V1: &str = include_str!("merges_v1.txt");

/// The regex pattern used for initial text splitting
pub(super) static PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)('s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+").unwrap()
});

/// Mapping from bytes to unicode symbols, avoiding whitespace/control characters
pub(super) static BYTES_TO_UNICODE: Lazy<BTreeMap<u8, char>> = Lazy::new(|| {
    let mut bs: Vec<u8> = Vec::new();
    // Range 33-126 is printable ASCII
    bs.extend(33..=126);
    // Range 161-172 + 174-255 is printable Latin-1 Supplement
    bs.extend(161..=172);
    bs.extend(174..=255);

    let mut cs: Vec<u32> = bs.iter().map(|&b| b as u32).collect();
    let mut n = 0u32;

    // Remaining bytes map to code points above the byte range,
    // so every possible byte value has a symbol
    for b in 0..=255u8 {
        if !bs.contains(&b) {
            bs.push(b);
            cs.push(256 + n);
            n += 1;
        }
    }

    // Create the mapping
    bs.into_iter()
        .zip(cs.into_iter().map(|c| char::from_u32(c).unwrap()))
        .collect()
});

/// Merge pairs from the embedded table, keyed to their rank (line order).
/// Lower rank means the pair merges earlier.
static MERGE_RANKS: Lazy<BTreeMap<(String, String), usize>> = Lazy::new(|| {
    MERGES_V1
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .enumerate()
        .filter_map(|(rank, line)| {
            line.split_once(' ')
                .map(|(first, second)| ((first.to_string(), second.to_string()), rank))
        })
        .collect()
});

/// Counts the sub-word symbols a single pre-split piece resolves to.
///
/// The piece's bytes are mapped into the symbol alphabet, then merge rules
/// are applied greedily (lowest rank first) until none apply. The number of
/// remaining symbols is the piece's token count.
pub(super) fn symbol_count(piece: &str) -> usize {
    // The byte table covers every value, so indexing cannot miss
    let mut parts: Vec<String> = piece
        .bytes()
        .map(|b| BYTES_TO_UNICODE[&b].to_string())
        .collect();

    // Apply merges until no more can be applied
    loop {
        let mut best_rank = usize::MAX;
        let mut best_idx = None;

        // Find the lowest-ranked merge rule that can be applied
        for (i, pair) in parts.windows(2).enumerate() {
            if let Some(&rank) = MERGE_RANKS.get(&(pair[0].clone(), pair[1].clone())) {
                if rank < best_rank {
                    best_rank = rank;
                    best_idx = Some(i);
                }
            }
        }

        // If no merge rule can be applied, we're done
        if best_idx.is_none() {
            break;
        }

        // Apply the merge
        if let Some(idx) = best_idx {
            let merged = format!("{}{}", parts[idx], parts[idx + 1]);
            parts[idx] = merged;
            parts.remove(idx + 1);
        }
    }

    parts.len()
}
