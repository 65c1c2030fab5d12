// 🔤 Description Similarity
// Bank statements and the ledger describe the same payment differently:
//   "Office Rent May"  vs  "OFFICE RENT-MAY"
// Both normalize to "office rent may", then compare by edit distance.

/// Lower-case, punctuation to spaces, collapse whitespace.
///
/// Example:
/// - normalize_description("OFFICE RENT-MAY") = "office rent may"
/// - normalize_description("  Acme,  Inc. ") = "acme inc"
pub fn normalize_description(description: &str) -> String {
    description
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Levenshtein distance over chars
///
/// Minimum number of single-character edits
/// (insertions, deletions, substitutions) to change one string into another
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let len1 = s1_chars.len();
    let len2 = s2_chars.len();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    // Two rolling rows instead of the full matrix
    let mut prev: Vec<usize> = (0..=len2).collect();
    let mut curr = vec![0; len2 + 1];

    for i in 1..=len1 {
        curr[0] = i;
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };

            curr[j] = std::cmp::min(
                std::cmp::min(
                    prev[j] + 1,     // deletion
                    curr[j - 1] + 1, // insertion
                ),
                prev[j - 1] + cost, // substitution
            );
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[len2]
}

/// Normalized similarity in [0, 1]: 1 - distance / longer length.
/// Inputs are compared as given; callers normalize first.
pub fn edit_similarity(s1: &str, s2: &str) -> f64 {
    let longest = s1.chars().count().max(s2.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein_distance(s1, s2) as f64 / longest as f64
}

/// Normalize both descriptions, then score them
pub fn description_similarity(a: &str, b: &str) -> f64 {
    edit_similarity(&normalize_description(a), &normalize_description(b))
}
