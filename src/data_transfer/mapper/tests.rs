use super::*;
use crate::value::LargeObject;
use arrow::array::{Array, AsArray};
use arrow::datatypes::{Date32Type, Float64Type, Int64Type, TimestampMicrosecondType};
use chrono::{NaiveDate, NaiveTime};
use std::str::FromStr;

fn column(name: &str, ordinal: usize, sql_type: SqlType) -> ColumnMetadata {
    ColumnMetadata::new(name, ordinal, sql_type)
}

fn decimal(text: &str) -> Value {
    Value::Decimal(Decimal::from_str(text).unwrap())
}

fn single(metadata_column: ColumnMetadata, kind: ExportKind) -> ExportColumn {
    let metadata = RowMetadata::new(vec![metadata_column]).unwrap();
    ExportColumns::new(&metadata, kind).unwrap().columns()[0].clone()
}

#[test]
fn test_decimal_export_types_follow_scale() {
    let whole = column("qty", 1, SqlType::Decimal).with_precision_scale(10, 0);
    let money = column("price", 1, SqlType::Numeric).with_precision_scale(12, 2);
    let unknown = column("ratio", 1, SqlType::Numeric);

    assert_eq!(export_type(&whole, ExportKind::Text).unwrap(), ExportType::Integer);
    assert_eq!(export_type(&whole, ExportKind::Columnar).unwrap(), ExportType::Integer);
    assert_eq!(export_type(&money, ExportKind::Text).unwrap(), ExportType::Float);
    assert_eq!(export_type(&unknown, ExportKind::Text).unwrap(), ExportType::Number);
    assert_eq!(export_type(&unknown, ExportKind::Columnar).unwrap(), ExportType::Float);
}

#[test]
fn test_catalog_declared_scale_zero_exports_as_integer() {
    let bare = ColumnMetadata::from_driver("amount", 1, "NUMERIC", true);
    assert_eq!(bare.scale, None);
    assert_eq!(export_type(&bare, ExportKind::Columnar).unwrap(), ExportType::Float);

    let declared = bare.clone().with_declared_type("numeric(12,0)");
    assert_eq!((declared.precision, declared.scale), (12, Some(0)));
    assert_eq!(declared.sql_type, SqlType::Numeric);
    assert_eq!(export_type(&declared, ExportKind::Columnar).unwrap(), ExportType::Integer);

    let money = bare.with_declared_type("decimal(10,2)");
    assert_eq!(export_type(&money, ExportKind::Columnar).unwrap(), ExportType::Float);
}

#[test]
fn test_blob_is_refused_by_text_but_not_columnar() {
    let blob = column("payload", 1, SqlType::Blob);
    let err = export_type(&blob, ExportKind::Text).unwrap_err();
    match err {
        TransferError::UnsupportedType { column, sink, .. } => {
            assert_eq!(column, "payload");
            assert_eq!(sink, "text");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(export_type(&blob, ExportKind::Columnar).unwrap(), ExportType::Binary);
}

#[test]
fn test_structured_types_are_refused_everywhere() {
    for sql_type in [SqlType::Struct, SqlType::Ref, SqlType::Array, SqlType::RowId, SqlType::Other] {
        let col = column("x", 1, sql_type);
        assert!(export_type(&col, ExportKind::Text).is_err());
        assert!(export_type(&col, ExportKind::Columnar).is_err());
    }
}

#[test]
fn test_text_fields() {
    let whole = single(
        column("qty", 1, SqlType::Decimal).with_precision_scale(10, 0),
        ExportKind::Text,
    );
    assert_eq!(text_field(&decimal("42"), &whole), "42");
    assert_eq!(text_field(&decimal("42.00"), &whole), "42");

    let unknown = single(column("ratio", 1, SqlType::Numeric), ExportKind::Text);
    assert_eq!(text_field(&decimal("7.000"), &unknown), "7");
    assert_eq!(text_field(&decimal("7.25"), &unknown), "7.25");

    let money = single(
        column("price", 1, SqlType::Decimal).with_precision_scale(8, 2),
        ExportKind::Text,
    );
    assert_eq!(text_field(&decimal("19.50"), &money), "19.5");

    let flag = single(column("active", 1, SqlType::Boolean), ExportKind::Text);
    assert_eq!(text_field(&Value::Boolean(true), &flag), "true");
    assert_eq!(text_field(&Value::Integer(0), &flag), "false");
    assert_eq!(text_field(&Value::Null, &flag), "");

    let bytes = single(column("digest", 1, SqlType::VarBinary), ExportKind::Text);
    assert_eq!(text_field(&Value::Bytes(vec![0xde, 0xad, 0x0f]), &bytes), "dead0f");

    let notes = single(column("notes", 1, SqlType::Clob), ExportKind::Text);
    let lob = Value::Lob(LargeObject::character("long text"));
    assert_eq!(text_field(&lob, &notes), "long text");
}

#[test]
fn test_temporal_text_fields() {
    let date = single(column("d", 1, SqlType::Date), ExportKind::Text);
    let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    assert_eq!(text_field(&Value::Date(day), &date), "2024-02-29");

    let time = single(column("t", 1, SqlType::Time), ExportKind::Text);
    let noon = NaiveTime::from_hms_opt(12, 30, 5).unwrap();
    assert_eq!(text_field(&Value::Time(noon), &time), "12:30:05");
    let precise = NaiveTime::from_hms_micro_opt(12, 30, 5, 250_000).unwrap();
    assert_eq!(text_field(&Value::Time(precise), &time), "12:30:05.250");

    let stamp = single(column("ts", 1, SqlType::Timestamp), ExportKind::Text);
    let at = day.and_hms_opt(23, 59, 1).unwrap();
    assert_eq!(text_field(&Value::Timestamp(at), &stamp), "2024-02-29 23:59:01");
}

#[test]
fn test_record_batch_conversion() {
    let metadata = RowMetadata::new(vec![
        column("id", 1, SqlType::BigInt),
        column("price", 2, SqlType::Decimal).with_precision_scale(8, 2),
        column("born", 3, SqlType::Date),
        column("seen", 4, SqlType::Timestamp),
        column("payload", 5, SqlType::Blob),
    ])
    .unwrap();
    let columns = ExportColumns::new(&metadata, ExportKind::Columnar).unwrap();
    let schema = columns.arrow_schema();
    assert_eq!(schema.field(0).data_type(), &DataType::Int64);
    assert_eq!(schema.field(1).data_type(), &DataType::Float64);
    assert!(schema.fields().iter().all(|field| field.is_nullable()));

    let epoch = NaiveDate::from_ymd_opt(1970, 1, 2).unwrap();
    let rows = vec![
        Row::new(vec![
            Value::Integer(1),
            decimal("2.50"),
            Value::Date(epoch),
            Value::Timestamp(epoch.and_hms_opt(0, 0, 1).unwrap()),
            Value::Lob(LargeObject::binary(vec![1, 2, 3])),
        ]),
        Row::new(vec![Value::Integer(2), Value::Null, Value::Null, Value::Null, Value::Null]),
    ];
    let batch = columns.record_batch(&schema, &rows).unwrap();
    assert_eq!(batch.num_rows(), 2);

    let ids = batch.column(0).as_primitive::<Int64Type>();
    assert_eq!(ids.value(1), 2);
    let prices = batch.column(1).as_primitive::<Float64Type>();
    assert_eq!(prices.value(0), 2.5);
    assert!(prices.is_null(1));
    let dates = batch.column(2).as_primitive::<Date32Type>();
    assert_eq!(dates.value(0), 1);
    let stamps = batch.column(3).as_primitive::<TimestampMicrosecondType>();
    assert_eq!(stamps.value(0), 86_401_000_000);
    let payload = batch.column(4).as_binary::<i32>();
    assert_eq!(payload.value(0), &[1, 2, 3]);
    assert!(payload.is_null(1));
}

#[test]
fn test_record_batch_rejects_unconvertible_values() {
    let metadata = RowMetadata::new(vec![column("id", 1, SqlType::Integer)]).unwrap();
    let columns = ExportColumns::new(&metadata, ExportKind::Columnar).unwrap();
    let schema = columns.arrow_schema();
    let rows = vec![Row::new(vec![Value::Text("not a number".to_string())])];
    assert!(matches!(
        columns.record_batch(&schema, &rows),
        Err(TransferError::UnsupportedType { .. })
    ));
}
