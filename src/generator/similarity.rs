//! Ratcliff/Obershelp string similarity.

/// Similarity of two strings in `[0, 1]`, case-insensitive.
///
/// Twice the number of matching characters divided by the total length, where
/// matches are found by recursively taking the longest common block.
pub fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();

    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    2.0 * matching_characters(&a, &b) as f64 / total as f64
}

fn matching_characters(a: &[char], b: &[char]) -> usize {
    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];

    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, size) = longest_match(a, b, (alo, ahi), (blo, bhi));
        if size == 0 {
            continue;
        }

        matched += size;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + size < ahi && j + size < bhi {
            pending.push((i + size, ahi, j + size, bhi));
        }
    }

    matched
}

/// Longest common block of `a[alo..ahi]` and `b[blo..bhi]`, earliest in `a`
/// then in `b` on ties.
fn longest_match(
    a: &[char],
    b: &[char],
    (alo, ahi): (usize, usize),
    (blo, bhi): (usize, usize),
) -> (usize, usize, usize) {
    let mut best = (alo, blo, 0);
    let width = bhi - blo;
    let mut previous = vec![0usize; width + 1];

    for i in alo..ahi {
        let mut current = vec![0usize; width + 1];

        for j in blo..bhi {
            if a[i] == b[j] {
                let length = previous[j - blo] + 1;
                current[j - blo + 1] = length;

                if length > best.2 {
                    best = (i + 1 - length, j + 1 - length, length);
                }
            }
        }

        previous = current;
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio() {
        assert_eq!(ratio("hello world", "hello world"), 1.0);
        assert_eq!(ratio("Hello", "hELLO"), 1.0);
        assert_eq!(ratio("", ""), 1.0);
        assert_eq!(ratio("abc", ""), 0.0);
        assert_eq!(ratio("abc", "xyz"), 0.0);
        assert_eq!(ratio("abcd", "bcde"), 0.75);
        assert_eq!(ratio("played", "play"), 0.8);
    }

    #[test]
    fn test_recursive_blocks() {
        // "ab" then "cd" on each side of the longest block "xyz".
        assert_eq!(matching_characters(
            &"abxyzcd".chars().collect::<Vec<_>>(),
            &"abQxyzQcd".chars().collect::<Vec<_>>()
        ), 7);
        assert!((ratio("apples", "apple") - 10.0 / 11.0).abs() < f64::EPSILON);
    }
}
