use rollsync_core::InternalStudent;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Lowercases, strips diacritics and collapses whitespace.
pub fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// The "Last, First" form the portal displays, normalized.
pub fn canonical_student_name(student: &InternalStudent) -> String {
    normalize_name(&format!("{}, {}", student.last_name, student.first_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_accents_and_spacing() {
        assert_eq!(normalize_name("  José   García "), "jose garcia");
        assert_eq!(normalize_name("José"), normalize_name("Jose"));
        assert_eq!(normalize_name("ZOË\tBRONTË"), "zoe bronte");
    }

    #[test]
    fn empty_stays_empty() {
        assert_eq!(normalize_name(""), "");
        assert_eq!(normalize_name(" \n "), "");
    }

    #[test]
    fn student_name_is_last_comma_first() {
        let student = InternalStudent {
            student_id: "s1".into(),
            first_name: " Ana  María".into(),
            last_name: "Núñez".into(),
        };
        assert_eq!(canonical_student_name(&student), "nunez, ana maria");
    }
}
