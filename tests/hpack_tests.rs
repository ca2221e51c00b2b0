/// HPACK codec integration tests (RFC 7541 subset)
mod common;

use nat_tunnel::hpack::{Decoder, DynamicTable, Encoder};

fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
    list.iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_unknown_header_literal_with_indexing() {
    // 空表编码未知头：字面量 + 增量索引 + 字面量名
    let enc = Encoder::new(0);
    let out = enc.encode(&pairs(&[("x-custom", "foo")])).unwrap();

    assert_eq!(out[0], 0x40);
    assert_eq!(out[1], 8);
    assert_eq!(&out[2..10], b"x-custom");
    assert_eq!(out[10], 3);
    assert_eq!(&out[11..14], b"foo");

    let dec = Decoder::new(0);
    let decoded = dec.decode(&out).unwrap();
    assert_eq!(decoded, pairs(&[("x-custom", "foo")]));

    // 双方动态表大小都应为 32 + 8 + 3 = 43
    assert_eq!(enc.dynamic_table_size(), 43);
    assert_eq!(dec.dynamic_table_size(), 43);
}

#[test]
fn test_dynamic_table_eviction_scenario() {
    let mut table = DynamicTable::new(64);
    table.add("a", "b"); // 34
    table.add("xx", "yyyyy"); // 39

    assert_eq!(table.len(), 1);
    assert_eq!(table.current_size(), 39);
    assert_eq!(table.get(0).unwrap().name, "xx");
}

#[test]
fn test_stateful_roundtrip_many_rounds() {
    let enc = Encoder::new(0);
    let dec = Decoder::new(0);

    let rounds = vec![
        pairs(&[
            (":method", "GET"),
            (":path", "/api/users"),
            ("host", "foo.tunnel.localhost"),
            ("user-agent", "integration-test/1.0"),
            ("x-request-id", "req-001"),
        ]),
        pairs(&[
            (":method", "GET"),
            (":path", "/api/users"),
            ("host", "foo.tunnel.localhost"),
            ("user-agent", "integration-test/1.0"),
            ("x-request-id", "req-002"),
        ]),
        pairs(&[
            (":method", "POST"),
            ("content-type", "application/json"),
            ("x-request-id", "req-003"),
            ("cookie", "session=abcdef"),
        ]),
        pairs(&[("cookie", "session=abcdef"), ("x-request-id", "req-001")]),
    ];

    for headers in rounds {
        let encoded = enc.encode(&headers).unwrap();
        let decoded = dec.decode(&encoded).unwrap();
        assert_eq!(decoded, headers);
        assert_eq!(enc.dynamic_table_size(), dec.dynamic_table_size());
    }
}

#[test]
fn test_repeated_encoding_shrinks() {
    let enc = Encoder::new(0);
    let headers = pairs(&[
        ("x-custom-header", "some-long-value-here"),
        ("x-another-one", "more-data"),
    ]);

    let first = enc.encode(&headers).unwrap();
    let second = enc.encode(&headers).unwrap();
    // 第二次全部命中动态表，输出显著缩短
    assert!(second.len() < first.len());
}

#[test]
fn test_huffman_flag_is_fatal() {
    let dec = Decoder::new(0);
    // 字面量 + 增量索引，名字符串带 Huffman 标志
    let data = [0x40, 0x83, 0x01, 0x02, 0x03];
    let err = dec.decode(&data).unwrap_err();
    assert!(err.to_string().contains("huffman"));
}

#[test]
fn test_case_insensitive_roundtrip() {
    let enc = Encoder::new(0);
    let dec = Decoder::new(0);

    let encoded = enc.encode(&pairs(&[("X-Mixed-Case", "Value")])).unwrap();
    let decoded = dec.decode(&encoded).unwrap();
    // 名称统一小写，值保持原样
    assert_eq!(decoded, pairs(&[("x-mixed-case", "Value")]));
}

#[test]
fn test_empty_value_header() {
    let enc = Encoder::new(0);
    let dec = Decoder::new(0);

    let headers = pairs(&[("accept", ""), ("x-empty", "")]);
    let decoded = dec.decode(&enc.encode(&headers).unwrap()).unwrap();
    assert_eq!(decoded, headers);
}

#[test]
fn test_oversize_entry_empties_table() {
    let mut table = DynamicTable::new(40);
    table.add("small", "v");
    assert_eq!(table.len(), 1);

    let big_value = "x".repeat(100);
    table.add("big", big_value);
    assert!(table.is_empty());
    assert_eq!(table.current_size(), 0);
}
