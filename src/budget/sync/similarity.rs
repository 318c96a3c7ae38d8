//! Description similarity used by the heuristic duplicate check.
//!
//! Bank descriptions of the same purchase differ in casing, punctuation, card suffixes and word
//! order between the provider and what a budget app shows. Scores are in `[0.0, 1.0]`.

use std::collections::BTreeSet;

/// Lowercase alphanumeric tokens of `text`.
pub fn tokens(text: &str) -> Vec<String> {
	text.split(|c: char| !c.is_alphanumeric())
		.filter(|token| !token.is_empty())
		.map(|token| token.to_lowercase())
		.collect()
}

/// Similarity of two descriptions.
///
/// The larger of the token-set Jaccard index and the normalised edit similarity of the sorted
/// token strings, so both reordered words and small spelling differences score well.
pub fn description_similarity(a: &str, b: &str) -> f64 {
	let left = tokens(a);
	let right = tokens(b);
	if left.is_empty() && right.is_empty() {
		return 1.0;
	}
	if left.is_empty() || right.is_empty() {
		return 0.0;
	}

	let left_set: BTreeSet<&str> = left.iter().map(String::as_str).collect();
	let right_set: BTreeSet<&str> = right.iter().map(String::as_str).collect();
	let shared = left_set.intersection(&right_set).count() as f64;
	let union = left_set.union(&right_set).count() as f64;
	let jaccard = shared / union;

	let left_joined = left_set.into_iter().collect::<Vec<_>>().join(" ");
	let right_joined = right_set.into_iter().collect::<Vec<_>>().join(" ");
	let edit = edit_similarity(&left_joined, &right_joined);

	jaccard.max(edit)
}

fn edit_similarity(a: &str, b: &str) -> f64 {
	let a: Vec<char> = a.chars().collect();
	let b: Vec<char> = b.chars().collect();
	let longest = a.len().max(b.len());
	if longest == 0 {
		return 1.0;
	}
	1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
	let mut previous: Vec<usize> = (0..=b.len()).collect();
	let mut current = vec![0; b.len() + 1];

	for (i, left) in a.iter().enumerate() {
		current[0] = i + 1;
		for (j, right) in b.iter().enumerate() {
			let substitution = previous[j] + usize::from(left != right);
			current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
		}
		std::mem::swap(&mut previous, &mut current);
	}
	previous[b.len()]
}
