use rust_tabular_api::Error;
use rust_tabular_api::ingestion::{
    IngestionContext, IngestionOptions, IngestionSource, ParsedTable, SourceKind, ingest_bytes,
};
use rust_tabular_api::types::{ColumnType, Value};

fn ingest(bytes: &[u8]) -> Result<ParsedTable, Error> {
    let ctx = IngestionContext::new(IngestionSource::Upload { bytes: bytes.len() });
    ingest_bytes(bytes, &ctx, &IngestionOptions::default())
}

fn types(parsed: &ParsedTable) -> Vec<ColumnType> {
    parsed
        .table
        .schema
        .fields
        .iter()
        .map(|f| f.column_type)
        .collect()
}

#[test]
fn semicolon_file_with_french_numbers_is_typed() {
    let parsed = ingest(b"siren;montant;heure\n732829320;1 200,50;9:15\n552100554;80;09:45\n").unwrap();

    assert_eq!(parsed.source_kind, SourceKind::Csv);
    assert_eq!(parsed.delimiter, Some(';'));
    assert_eq!(
        types(&parsed),
        vec![ColumnType::Identifier, ColumnType::Number, ColumnType::Time]
    );
    assert_eq!(parsed.table.rows[0][0], Value::Text("732829320".to_string()));
    assert_eq!(parsed.table.rows[0][1], Value::Number(1200.5));
    // Times are kept as written.
    assert_eq!(parsed.table.rows[0][2], Value::Text("9:15".to_string()));
    assert_eq!(parsed.table.rows[1][2], Value::Text("09:45".to_string()));
}

#[test]
fn every_caster_is_reachable() {
    let text = "\
actif\tjour\tdepuis\tduree\tlibelle
true\t2023-01-15\t2023-01-15 08:30\t2 hours\tun
false\t15/02/2023\t2023-02-01T17:05\t45 minutes\tdeux
";
    let parsed = ingest(text.as_bytes()).unwrap();

    assert_eq!(parsed.delimiter, Some('\t'));
    assert_eq!(
        types(&parsed),
        vec![
            ColumnType::Boolean,
            ColumnType::Date,
            ColumnType::DateTime,
            ColumnType::Duration,
            ColumnType::Text,
        ]
    );
    assert_eq!(parsed.table.rows[0][0], Value::Bool(true));
    assert_eq!(parsed.table.rows[0][3], Value::Number(7200.0));
    assert_eq!(parsed.table.rows[1][3], Value::Number(2700.0));
}

#[test]
fn one_bad_value_demotes_the_column() {
    let parsed = ingest(b"siren,note\n732829320,1\n123456789,2.5\n").unwrap();
    // 123456789 fails the checksum and 2.5 is not a boolean; both still parse as numbers.
    assert_eq!(types(&parsed), vec![ColumnType::Number, ColumnType::Number]);
    assert_eq!(parsed.table.rows[1][0], Value::Number(123456789.0));
}

#[test]
fn null_tokens_become_nulls() {
    let parsed = ingest(b"a,b\n12,x\nNA,y\n,z\n").unwrap();
    assert_eq!(types(&parsed)[0], ColumnType::Number);
    assert_eq!(parsed.table.rows[1][0], Value::Null);
    assert_eq!(parsed.table.rows[2][0], Value::Null);
}

#[test]
fn latin1_bytes_are_decoded() {
    let bytes = b"nom;ville\nJos\xe9;Orl\xe9ans\nH\xe9l\xe8ne;N\xeemes\nFran\xe7ois;B\xe9ziers\n";
    let parsed = ingest(bytes).unwrap();

    assert_ne!(parsed.encoding.as_deref(), Some("UTF-8"));
    assert_eq!(parsed.table.rows[0][0], Value::Text("José".to_string()));
    assert_eq!(parsed.table.rows[2][1], Value::Text("Béziers".to_string()));
}

#[test]
fn utf8_bom_is_stripped_from_first_header() {
    let parsed = ingest("\u{feff}code,nom\n1,a\n2,b\n".as_bytes()).unwrap();
    let names: Vec<&str> = parsed.table.schema.field_names().collect();
    assert_eq!(names, vec!["code", "nom"]);
}

#[test]
fn ragged_rows_and_blank_headers() {
    let parsed = ingest(b"a;;c\n1;2\n3;4;5;6\n7;8;9\n").unwrap();
    let names: Vec<&str> = parsed.table.schema.field_names().collect();
    assert_eq!(names, vec!["a", "column_2", "c"]);
    assert_eq!(parsed.table.row_count(), 3);
    assert_eq!(parsed.table.rows[0][2], Value::Null);
    assert_eq!(parsed.table.rows[1].len(), 3);
}

#[test]
fn quoted_delimiters_do_not_split_fields() {
    let parsed = ingest(b"nom,adresse\nA,\"1, rue de la Paix\"\nB,\"2, place Bellecour\"\n").unwrap();
    assert_eq!(parsed.delimiter, Some(','));
    assert_eq!(
        parsed.table.rows[0][1],
        Value::Text("1, rue de la Paix".to_string())
    );
}

#[test]
fn header_only_file_is_a_parse_error() {
    let err = ingest(b"a;b;c\n").unwrap_err();
    assert!(matches!(err, Error::Parse { .. }));
    assert_eq!(err.kind().status(), 422);
}

#[test]
fn binary_content_is_rejected() {
    let err = ingest(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR").unwrap_err();
    assert!(matches!(err, Error::UnsupportedFileType { .. }));
}

#[test]
fn zip_without_workbook_is_rejected() {
    let err = ingest(b"PK\x03\x04not a workbook at all").unwrap_err();
    assert!(matches!(err, Error::UnsupportedFileType { .. }));
}

#[test]
fn repeated_headers_are_numbered() {
    let parsed = ingest(b"code;nom;code;code_2\n1;Lyon;2;3\n").unwrap();
    let names: Vec<&str> = parsed.table.schema.field_names().collect();
    assert_eq!(names, vec!["code", "nom", "code_3", "code_2"]);
    assert_eq!(parsed.table.rows[0][2], Value::Number(2.0));
}
