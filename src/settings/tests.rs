use super::*;
use crate::db_types::DatabaseType;

#[test]
fn test_defaults_apply_to_empty_document() {
    let settings = Settings::from_toml_str("").unwrap();
    assert_eq!(settings.engine.fetch_size, 10_000);
    assert_eq!(settings.engine.permit_wait(), Duration::from_millis(10));
    assert_eq!(settings.engine.io_threads, 4);
    assert_eq!(settings.logging.level, "info");
    assert!(settings.datasources.is_empty());
}

#[test]
fn test_datasources_and_properties_are_read() {
    let settings = Settings::from_toml_str(
        r#"
        [engine]
        fetch_size = 250

        [datasources.source]
        type = "sqlite"
        host = "/tmp/source.db"

        [datasources.warehouse]
        type = "postgres"
        host = "db.internal"
        username = "loader"
        max_connections = 4

        [properties]
        schema = "sales"
        limit = 5
        "#,
    )
    .unwrap();

    assert_eq!(settings.engine.fetch_size, 250);
    assert_eq!(settings.datasources["source"].db_type, DatabaseType::SQLite);
    let warehouse = &settings.datasources["warehouse"];
    assert_eq!(warehouse.db_type, DatabaseType::PostgreSQL);
    assert_eq!(warehouse.port_or_default(), 5432);
    assert_eq!(warehouse.max_connections, 4);
    assert_eq!(settings.properties["schema"], ConfigValue::from("sales"));
    assert_eq!(settings.properties["limit"], ConfigValue::Integer(5));
}

#[test]
fn test_invalid_values_are_configuration_errors() {
    let err = Settings::from_toml_str("[engine]\nfetch_size = 0").unwrap_err();
    assert!(err.is_configuration());

    let err = Settings::from_toml_str("[datasources.broken]\ntype = \"mysql\"").unwrap_err();
    assert!(err.is_configuration());

    let err = Settings::from_toml_str("[engine]\nfetch_size = \"many\"").unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_missing_settings_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
    assert!(err.to_string().contains("does not exist"));
}

#[test]
fn test_overrides_shadow_properties() {
    let settings = Settings::from_toml_str("[properties]\nschema = \"sales\"").unwrap();
    let properties =
        settings.external_properties(&[("schema".to_string(), "audit".to_string())]);
    assert_eq!(properties["schema"], ConfigValue::from("audit"));
}
