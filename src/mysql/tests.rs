use super::*;

fn described(name: &str, ordinal: usize, type_name: &str) -> ColumnMetadata {
    ColumnMetadata::from_driver(name, ordinal, type_name, true)
}

#[test]
fn test_declared_types_fill_decimal_scales() {
    let columns = vec![
        described("id", 1, "BIGINT"),
        described("qty", 2, "DECIMAL"),
        described("price", 3, "DECIMAL"),
    ];
    let declared = vec![
        "bigint(20)".to_string(),
        "decimal(12,0)".to_string(),
        "decimal(10,2) unsigned".to_string(),
    ];

    let columns = apply_declared_types(columns, declared);
    assert_eq!(columns[0].precision, 0);
    assert_eq!((columns[1].precision, columns[1].scale), (12, Some(0)));
    assert_eq!((columns[2].precision, columns[2].scale), (10, Some(2)));
    assert_eq!(columns[2].type_name, "DECIMAL");
}

#[test]
fn test_mismatched_declarations_are_ignored() {
    let columns = vec![described("qty", 1, "DECIMAL")];
    let columns = apply_declared_types(columns, Vec::new());
    assert_eq!(columns[0].scale, None);
}
