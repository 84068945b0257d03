//! Line-level comparison of recognized text against ground truth.
//!
//! Recognition output rarely lines up one-to-one with the reference
//! transcription: backends drop lines, invent lines, and merge lines. Before
//! any per-line error metric is meaningful the two sequences have to be
//! aligned. The alignment here is a greedy forward match using normalized
//! longest-common-subsequence similarity to decide whether a ground-truth
//! line and a recognized line correspond, with bounded lookahead past
//! spurious recognized lines.

/// Minimum normalized LCS similarity for two lines to be considered the
/// same line of the document.
const SIMILARITY_THRESHOLD: f64 = 0.5;

/// Punctuation stripped from both texts in relaxed mode.
const RELAXED_PUNCTUATION: &[char] = &['.', ',', ':', ';'];

/// One aligned pairing in a comparison. Either side may be absent: a
/// ground-truth line the recognizer missed has an empty `received`, and a
/// recognized line with no counterpart has an empty `expected`.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonLine {
    /// Index of the recognized line, when one participates in this row.
    pub number: Option<usize>,
    /// Levenshtein distance between the two (whitespace-normalized) sides.
    pub distance: usize,
    /// Character error rate as a formatted percentage. `"100.00"` is the
    /// fixed sentinel when the ground-truth side is empty; it is a
    /// documented edge-case policy, not a principled metric.
    pub cer: String,
    pub expected: String,
    pub received: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonReport {
    pub lines: Vec<ComparisonLine>,
    pub total_errors: usize,
}

impl ComparisonReport {
    /// Render the report as the tab-separated table written to `.tsv` files:
    /// a header, one row per aligned line, a `Total errors` label row and a
    /// numeric total row.
    pub fn to_tsv(&self) -> String {
        let mut out = vec!["Errors\tCER (%)\tExpected text\tReceived text".to_string()];
        for line in &self.lines {
            out.push(format!(
                "{}\t{}\t{}\t{}",
                line.distance, line.cer, line.expected, line.received
            ));
        }
        out.push("Total errors\t\t\t".to_string());
        out.push(format!("{}\t\t\t", self.total_errors));
        out.join("\n")
    }
}

/// Compare recognized text against ground-truth text.
///
/// In relaxed mode both texts are lowercased and a fixed punctuation set is
/// stripped before scoring. Alignment walks the ground-truth lines in order,
/// keeping a cursor into the recognized lines:
///
/// 1. If the line at the cursor scores at or above the similarity threshold,
///    the pairing is accepted and the cursor advances past it.
/// 2. Otherwise the remaining recognized lines are scanned for the first one
///    that matches. If found, the skipped recognized lines are held aside as
///    extras and the cursor advances past the match. If not, the ground-truth
///    line is recorded as unmatched and the cursor stays put.
/// 3. Recognized lines at or past the final cursor position are appended as
///    trailing unmatched rows. The one exception: a single leftover line
///    that was already examined and rejected is a full miss and produces no
///    row of its own.
/// 4. Extras from step 2 are reinserted immediately before the row of the
///    next higher-numbered recognized line, preserving their original order.
pub fn compare(recognized: &str, ground_truth: &str, relaxed: bool) -> ComparisonReport {
    let preprocess = |text: &str| -> Vec<String> {
        text.trim()
            .lines()
            .map(|line| {
                if relaxed {
                    line.to_lowercase()
                        .chars()
                        .filter(|c| !RELAXED_PUNCTUATION.contains(c))
                        .collect()
                } else {
                    line.to_string()
                }
            })
            .collect()
    };

    let gt_lines = preprocess(ground_truth);
    let rec_lines = preprocess(recognized);

    let mut rows: Vec<ComparisonLine> = Vec::new();
    let mut extras: Vec<usize> = Vec::new();
    let mut cursor = 0usize;
    // Whether the line at the cursor was ever examined and rejected.
    let mut cursor_examined = false;

    for gt_line in &gt_lines {
        if cursor < rec_lines.len() {
            cursor_examined = true;
            if lcs_similarity(gt_line, &rec_lines[cursor]) >= SIMILARITY_THRESHOLD {
                rows.push(line_data(gt_line, &rec_lines[cursor], Some(cursor)));
                cursor += 1;
                cursor_examined = false;
                continue;
            }
        }
        // The line at the cursor does not correspond. Look for the first
        // later recognized line that does.
        let found = (cursor + 1..rec_lines.len())
            .find(|&j| lcs_similarity(gt_line, &rec_lines[j]) >= SIMILARITY_THRESHOLD);
        match found {
            Some(j) => {
                extras.extend(cursor..j);
                rows.push(line_data(gt_line, &rec_lines[j], Some(j)));
                cursor = j + 1;
                cursor_examined = false;
            }
            None => {
                rows.push(line_data(gt_line, "", None));
            }
        }
    }

    // Leftover recognized lines become trailing rows. The one exception is a
    // single leftover line that was already examined and rejected; that line
    // has no counterpart anywhere and produces no row.
    let single_rejected_leftover = cursor_examined && cursor + 1 == rec_lines.len();
    if !single_rejected_leftover {
        for j in cursor..rec_lines.len() {
            rows.push(line_data("", &rec_lines[j], Some(j)));
        }
    }

    // Reinsert skipped recognized lines just before the next row whose
    // recognized index is higher, keeping their original relative order.
    for index in extras {
        let pos = rows
            .iter()
            .position(|row| row.number.is_some_and(|n| index < n));
        if let Some(pos) = pos {
            rows.insert(pos, line_data("", &rec_lines[index], Some(index)));
        }
    }

    let total_errors = rows.iter().map(|row| row.distance).sum();
    ComparisonReport {
        lines: rows,
        total_errors,
    }
}

/// Build one row: whitespace-normalize both sides, then compute Levenshtein
/// distance and CER. CER divides by the length of the reference line, as is
/// conventional in OCR evaluation, not by the longer of the two strings.
fn line_data(gt_line: &str, rec_line: &str, number: Option<usize>) -> ComparisonLine {
    let expected = normalize_whitespace(gt_line);
    let received = normalize_whitespace(rec_line);
    let distance = levenshtein(&expected, &received);
    let cer = if expected.is_empty() {
        "100.00".to_string()
    } else {
        format!(
            "{:.2}",
            100.0 * distance as f64 / expected.chars().count() as f64
        )
    };
    ComparisonLine {
        number,
        distance,
        cer,
        expected,
        received,
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Levenshtein edit distance over characters.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Normalized longest-common-subsequence similarity in [0, 1]: the LCS
/// length divided by the length of the longer string. Two empty strings are
/// identical by convention.
pub fn lcs_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
        curr.fill(0);
    }
    prev[b.len()] as f64 / longest as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_levenshtein_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("flaw", "lawn"), 2);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_lcs_similarity_range() {
        assert_eq!(lcs_similarity("", ""), 1.0);
        assert_eq!(lcs_similarity("abc", "abc"), 1.0);
        assert_eq!(lcs_similarity("abc", "xyz"), 0.0);
        assert_eq!(lcs_similarity("abcd", "abxd"), 0.75);
        assert_eq!(lcs_similarity("", "abc"), 0.0);
    }

    #[test]
    fn test_identical_texts_report_zero_errors() {
        let text = "April 25, 2019\nMy darling,\nday today was.";
        let report = compare(text, text, false);
        assert_eq!(report.lines.len(), 3);
        assert_eq!(report.total_errors, 0);
        for line in &report.lines {
            assert_eq!(line.distance, 0);
            assert_eq!(line.cer, "0.00");
            assert_eq!(line.expected, line.received);
        }
    }

    #[test]
    fn test_single_matching_line() {
        let report = compare("a", "a", false);
        assert_eq!(report.lines.len(), 1);
        assert_eq!(report.lines[0].distance, 0);
        assert_eq!(report.lines[0].cer, "0.00");
        assert_eq!(report.total_errors, 0);
    }

    #[test]
    fn test_dissimilar_line_is_a_full_miss() {
        // Below-threshold similarity is a full miss, not partial credit.
        let report = compare("a", "b", false);
        assert_eq!(report.lines.len(), 1);
        assert_eq!(report.lines[0].expected, "b");
        assert_eq!(report.lines[0].received, "");
        assert_eq!(report.lines[0].distance, 1);
        assert_eq!(report.lines[0].cer, "100.00");
        assert_eq!(report.total_errors, 1);
    }

    #[test]
    fn test_unmatched_recognized_lines_all_get_rows() {
        // Nothing matches, but both recognized lines must still surface and
        // count toward the total.
        let report = compare("a\nb", "x", false);
        assert_eq!(report.lines.len(), 3);
        assert_eq!(report.lines[0].expected, "x");
        assert_eq!(report.lines[0].received, "");
        assert_eq!(report.lines[1].received, "a");
        assert_eq!(report.lines[2].received, "b");
        assert_eq!(report.total_errors, 3);
    }

    #[test]
    fn test_single_rejected_line_dropped_with_longer_ground_truth() {
        let report = compare("a", "x\ny", false);
        assert_eq!(report.lines.len(), 2);
        assert!(report.lines.iter().all(|l| l.received.is_empty()));
        assert_eq!(report.total_errors, 2);
    }

    #[test]
    fn test_single_trailing_line_after_match_is_kept() {
        let report = compare("April 25, 2019\nstray", "April 25, 2019", false);
        assert_eq!(report.lines.len(), 2);
        assert_eq!(report.lines[1].received, "stray");
        assert_eq!(report.lines[1].expected, "");
    }

    #[test]
    fn test_empty_ground_truth_line_uses_sentinel() {
        let report = compare("anything at all", "", false);
        for line in &report.lines {
            assert_eq!(line.cer, "100.00");
        }
    }

    #[test]
    fn test_near_match_scores_partial_cer() {
        let report = compare("Avril 25, 2019", "April 25, 2019", false);
        assert_eq!(report.lines.len(), 1);
        assert_eq!(report.lines[0].distance, 1);
        // 1 error over 14 reference characters.
        assert_eq!(report.lines[0].cer, "7.14");
    }

    #[test]
    fn test_missing_recognized_line_in_middle() {
        let gt = "April 25, 2019\nwhat a wonderful\nday today was.";
        let rec = "April 25, 2019\nday today was.";
        let report = compare(rec, gt, false);
        assert_eq!(report.lines.len(), 3);
        assert_eq!(report.lines[0].expected, "April 25, 2019");
        assert_eq!(report.lines[1].expected, "what a wonderful");
        assert_eq!(report.lines[1].received, "");
        assert_eq!(report.lines[2].expected, "day today was.");
    }

    #[test]
    fn test_extra_recognized_line_is_reinserted_in_position() {
        let gt = "April 25, 2019\nday today was.";
        let rec = "April 25, 2019\nrooujjlh\nday today was.";
        let report = compare(rec, gt, false);
        assert_eq!(report.lines.len(), 3);
        assert_eq!(report.lines[0].received, "April 25, 2019");
        assert_eq!(report.lines[1].expected, "");
        assert_eq!(report.lines[1].received, "rooujjlh");
        assert_eq!(report.lines[2].received, "day today was.");
    }

    #[test]
    fn test_leading_extra_line_inserted_before_first_match() {
        let gt = "April 25, 2019";
        let rec = "doc 01\nApril 25, 2019";
        let report = compare(rec, gt, false);
        assert_eq!(report.lines.len(), 2);
        assert_eq!(report.lines[0].received, "doc 01");
        assert_eq!(report.lines[0].expected, "");
        assert_eq!(report.lines[1].received, "April 25, 2019");
    }

    #[test]
    fn test_trailing_recognized_lines_appended() {
        let gt = "April 25, 2019";
        let rec = "April 25, 2019\nstray one\nstray two";
        let report = compare(rec, gt, false);
        assert_eq!(report.lines.len(), 3);
        assert_eq!(report.lines[1].received, "stray one");
        assert_eq!(report.lines[2].received, "stray two");
        // Trailing rows have no ground truth, so they use the sentinel.
        assert_eq!(report.lines[1].cer, "100.00");
    }

    #[test]
    fn test_matched_rows_preserve_ground_truth_order() {
        let gt = "first line here\nsecond line here\nthird line here";
        let rec = "noise\nfirst line here\nsecond line here\nmore noise!!\nthird line here";
        let report = compare(rec, gt, false);

        let matched: Vec<&str> = report
            .lines
            .iter()
            .filter(|l| !l.expected.is_empty())
            .map(|l| l.expected.as_str())
            .collect();
        assert_eq!(
            matched,
            vec!["first line here", "second line here", "third line here"]
        );

        // Every recognized line shows up exactly once, in original order.
        let received: Vec<&str> = report
            .lines
            .iter()
            .filter(|l| !l.received.is_empty())
            .map(|l| l.received.as_str())
            .collect();
        assert_eq!(
            received,
            vec![
                "noise",
                "first line here",
                "second line here",
                "more noise!!",
                "third line here"
            ]
        );
    }

    #[test]
    fn test_relaxed_mode_ignores_case_and_punctuation() {
        let report = compare("my darling\n", "My, darling:\n", true);
        assert_eq!(report.lines.len(), 1);
        assert_eq!(report.lines[0].distance, 0);
        assert_eq!(report.total_errors, 0);
    }

    #[test]
    fn test_strict_mode_counts_punctuation() {
        let report = compare("my darling\n", "My, darling:\n", false);
        assert_eq!(report.lines.len(), 1);
        assert!(report.total_errors > 0);
    }

    #[test]
    fn test_whitespace_runs_are_collapsed() {
        let report = compare("  day   today  was. ", "day today was.", false);
        assert_eq!(report.lines[0].distance, 0);
        assert_eq!(report.total_errors, 0);
    }

    #[test]
    fn test_tsv_format() {
        let report = compare("a", "a", false);
        let tsv = report.to_tsv();
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(lines[0], "Errors\tCER (%)\tExpected text\tReceived text");
        assert_eq!(lines[1], "0\t0.00\ta\ta");
        assert_eq!(lines[2], "Total errors\t\t\t");
        assert_eq!(lines[3], "0\t\t\t");
    }

    #[test]
    fn test_tsv_total_row_sums_distances() {
        let report = compare("abcd\nxyz", "abxd\nxyz", false);
        let tsv = report.to_tsv();
        assert!(tsv.ends_with(&format!("{}\t\t\t", report.total_errors)));
        assert_eq!(report.total_errors, 1);
    }

    #[test]
    fn test_empty_inputs() {
        let report = compare("", "", false);
        assert!(report.lines.is_empty());
        assert_eq!(report.total_errors, 0);
    }

    #[test]
    fn test_ground_truth_longer_than_recognition() {
        let gt = "only line recognized\nnever seen line";
        let report = compare("only line recognized", gt, false);
        assert_eq!(report.lines.len(), 2);
        assert_eq!(report.lines[1].expected, "never seen line");
        assert_eq!(report.lines[1].received, "");
    }
}
