//! Dotted version ("quad") parsing and comparison.

use std::cmp::Ordering;

/// Parse a dotted version string into its integer components.
///
/// Non-numeric components parse as 0, matching the lenient handling of
/// host-reported versions like "7.1.431.0" or truncated "2.11".
pub fn parse_quad(version: &str) -> Vec<i32> {
    version
        .trim()
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<i32>().unwrap_or(0))
        .collect()
}

/// Compare two version quads, treating missing components as 0.
pub fn compare_quads(a: &[i32], b: &[i32]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let av = a.get(i).copied().unwrap_or(0);
        let bv = b.get(i).copied().unwrap_or(0);
        match av.cmp(&bv) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_strings() {
        assert_eq!(parse_quad("7.1.431.0"), vec![7, 1, 431, 0]);
        assert_eq!(parse_quad("3.20"), vec![3, 20]);
        assert_eq!(parse_quad(""), Vec::<i32>::new());
    }

    #[test]
    fn non_numeric_components_become_zero() {
        assert_eq!(parse_quad("6.10.0-beta"), vec![6, 10, 0]);
        assert_eq!(parse_quad("abc"), vec![0]);
    }

    #[test]
    fn missing_components_compare_as_zero() {
        assert_eq!(compare_quads(&[1], &[1, 0, 0]), Ordering::Equal);
        assert_eq!(compare_quads(&[1, 2], &[1, 2, 1]), Ordering::Less);
        assert_eq!(compare_quads(&[2], &[1, 99]), Ordering::Greater);
    }

    #[test]
    fn ordering_is_componentwise() {
        assert_eq!(compare_quads(&[5, 1], &[5, 2]), Ordering::Less);
        assert_eq!(compare_quads(&[6, 0, 1], &[6, 0, 0]), Ordering::Greater);
        assert_eq!(compare_quads(&[], &[]), Ordering::Equal);
        assert_eq!(compare_quads(&[], &[0, 0]), Ordering::Equal);
    }
}
