use super::*;

fn config(json: serde_json::Value) -> ConnectionConfig {
    serde_json::from_value(json).unwrap()
}

#[test]
fn test_database_type_accepts_aliases() {
    let pg = config(serde_json::json!({ "type": "postgres", "host": "db" }));
    assert_eq!(pg.db_type, DatabaseType::PostgreSQL);
    assert_eq!(pg.port_or_default(), 5432);

    let lite = config(serde_json::json!({ "dbType": "sqlite", "host": "/tmp/a.db" }));
    assert_eq!(lite.db_type, DatabaseType::SQLite);
    assert_eq!(lite.max_connections, 10);
}

#[test]
fn test_explicit_port_wins() {
    let my = config(serde_json::json!({ "type": "mysql", "host": "db", "port": 3307 }));
    assert_eq!(my.port_or_default(), 3307);
}

#[test]
fn test_validate_requires_host_and_connections() {
    let lite = config(serde_json::json!({ "type": "sqlite" }));
    let err = lite.validate("local").unwrap_err();
    assert!(err.contains("database file path"), "{}", err);

    let pg = config(serde_json::json!({ "type": "postgresql", "host": "db", "max_connections": 0 }));
    assert!(pg.validate("warehouse").unwrap_err().contains("warehouse"));
}

#[test]
fn test_placeholder_style_follows_database() {
    assert_eq!(PlaceholderStyle::from(DatabaseType::PostgreSQL), PlaceholderStyle::Dollar);
    assert_eq!(PlaceholderStyle::from(DatabaseType::MySQL), PlaceholderStyle::QuestionMark);
    assert_eq!(PlaceholderStyle::from(DatabaseType::SQLite), PlaceholderStyle::QuestionMark);
}

#[test]
fn test_only_mysql_treats_backslash_as_escape() {
    assert_eq!(LiteralStyle::from(DatabaseType::MySQL), LiteralStyle::BackslashEscapes);
    assert_eq!(LiteralStyle::from(DatabaseType::PostgreSQL), LiteralStyle::Standard);
    assert_eq!(LiteralStyle::from(DatabaseType::SQLite), LiteralStyle::Standard);
}
