//! Posture-check comparison
//!
//! Management re-sends the full check list with every network map; the
//! engine skips re-evaluation when the new list equals the last applied
//! one. Equality is order-insensitive both within a group's file list and
//! across groups, but multiplicity matters.

use overlink_proto::Checks;

/// Whether two check sets demand the same posture.
///
/// Each group's files are compared as a multiset, and the groups themselves
/// may arrive in any order.
pub fn is_checks_equal(a: &[Checks], b: &[Checks]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    normalize(a) == normalize(b)
}

fn normalize(checks: &[Checks]) -> Vec<Vec<String>> {
    let mut groups: Vec<Vec<String>> = checks
        .iter()
        .map(|c| {
            let mut files = c.files.clone();
            files.sort_unstable();
            files
        })
        .collect();
    groups.sort_unstable();
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(groups: &[&[&str]]) -> Vec<Checks> {
        groups
            .iter()
            .map(|files| Checks {
                files: files.iter().map(|f| f.to_string()).collect(),
            })
            .collect()
    }

    #[test]
    fn test_equal_in_order() {
        let a = checks(&[&["testfile1", "testfile2"]]);
        let b = checks(&[&["testfile1", "testfile2"]]);
        assert!(is_checks_equal(&a, &b));
    }

    #[test]
    fn test_equal_in_reverse_order() {
        let a = checks(&[&["testfile1", "testfile2"]]);
        let b = checks(&[&["testfile2", "testfile1"]]);
        assert!(is_checks_equal(&a, &b));
    }

    #[test]
    fn test_unequal_files() {
        let a = checks(&[&["testfile1", "testfile2"]]);
        let b = checks(&[&["testfile1", "testfile3"]]);
        assert!(!is_checks_equal(&a, &b));
    }

    #[test]
    fn test_compared_with_empty_group() {
        let a = checks(&[&["testfile1", "testfile2"]]);
        let b = checks(&[&[]]);
        assert!(!is_checks_equal(&a, &b));
    }

    #[test]
    fn test_group_permutation() {
        let a = checks(&[&["testfile1", "testfile2"], &["testfile4", "testfile3"]]);
        let b = checks(&[&["testfile3", "testfile4"], &["testfile2", "testfile1"]]);
        assert!(is_checks_equal(&a, &b));
    }

    #[test]
    fn test_group_permutation_with_shared_first_element() {
        let a = checks(&[
            &["testfile0", "testfile1"],
            &["testfile0", "testfile2"],
            &["testfile0", "testfile3"],
        ]);
        let b = checks(&[
            &["testfile0", "testfile1"],
            &["testfile0", "testfile3"],
            &["testfile0", "testfile2"],
        ]);
        assert!(is_checks_equal(&a, &b));
    }

    #[test]
    fn test_symmetry() {
        let a = checks(&[&["f1", "f2"], &["f3"]]);
        let b = checks(&[&["f3"], &["f2", "f1"]]);
        assert_eq!(is_checks_equal(&a, &b), is_checks_equal(&b, &a));
    }

    #[test]
    fn test_multiplicity_matters() {
        let a = checks(&[&["f1", "f1"]]);
        let b = checks(&[&["f1"]]);
        assert!(!is_checks_equal(&a, &b));
    }
}
