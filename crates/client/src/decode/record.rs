//! Container record parsing.
//!
//! One inflated member holds a line-oriented header block (version
//! line, `Name: value` fields, blank-line terminator) followed by a
//! payload of exactly `Content-Length` bytes.

use bytes::Bytes;

use warchive_core::records::{ContainerRecord, RecordType};

/// Parse one inflated member into a container record.
///
/// Errors are returned as a human-readable reason; the decoder reports
/// them as a `MalformedRecord` for this member only.
pub(crate) fn parse_record(raw: &[u8]) -> Result<ContainerRecord, String> {
    let (header_end, body_start) = find_blank_line(raw).ok_or("header block has no terminator")?;
    let header_text =
        std::str::from_utf8(&raw[..header_end]).map_err(|_| "header block is not valid UTF-8")?;

    let mut lines = header_text.split('\n').map(|line| line.trim_end_matches('\r'));

    let version = lines.next().unwrap_or_default();
    if !version.starts_with("WARC/") {
        return Err(format!("unsupported version line {version:?}"));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("malformed header field {line:?}"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let record_type = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("WARC-Type"))
        .map(|(_, v)| RecordType::from_wire(v))
        .ok_or("missing WARC-Type header")?;

    let payload_length: u64 = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .ok_or("missing Content-Length header")?
        .1
        .parse()
        .map_err(|_| "unparseable Content-Length header")?;

    let body = &raw[body_start..];
    if (body.len() as u64) < payload_length {
        return Err(format!("short payload: have {} bytes, declared {}", body.len(), payload_length));
    }
    let payload = Bytes::copy_from_slice(&body[..payload_length as usize]);

    Ok(ContainerRecord { record_type, headers, payload, payload_length })
}

/// Locate the blank line separating headers from payload.
///
/// Returns (end of header block, start of payload). Accepts CRLF or
/// bare LF line endings, whichever terminator appears first.
fn find_blank_line(raw: &[u8]) -> Option<(usize, usize)> {
    let crlf = find_subslice(raw, b"\r\n\r\n").map(|pos| (pos, pos + 4));
    let lf = find_subslice(raw, b"\n\n").map(|pos| (pos, pos + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(headers: &str, payload: &[u8]) -> Vec<u8> {
        let mut raw = headers.as_bytes().to_vec();
        raw.extend_from_slice(payload);
        raw.extend_from_slice(b"\r\n\r\n");
        raw
    }

    #[test]
    fn test_parse_complete_record() {
        let raw = member(
            "WARC/1.0\r\nWARC-Type: response\r\nWARC-Target-URI: http://example.com/\r\nContent-Length: 5\r\n\r\n",
            b"hello",
        );
        let record = parse_record(&raw).unwrap();
        assert_eq!(record.record_type, RecordType::Response);
        assert_eq!(record.target_uri(), Some("http://example.com/"));
        assert_eq!(&record.payload[..], b"hello");
        assert_eq!(record.payload_length, 5);
    }

    #[test]
    fn test_parse_lf_only_line_endings() {
        let raw = member("WARC/1.0\nWARC-Type: metadata\nContent-Length: 2\n\n", b"ok");
        let record = parse_record(&raw).unwrap();
        assert_eq!(record.record_type, RecordType::Metadata);
        assert_eq!(&record.payload[..], b"ok");
    }

    #[test]
    fn test_headers_preserve_wire_order() {
        let raw = member(
            "WARC/1.0\r\nWARC-Type: warcinfo\r\nWARC-Record-ID: <urn:uuid:1>\r\nContent-Length: 0\r\n\r\n",
            b"",
        );
        let record = parse_record(&raw).unwrap();
        let names: Vec<&str> = record.headers.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["WARC-Type", "WARC-Record-ID", "Content-Length"]);
        assert_eq!(record.record_type, RecordType::Info);
    }

    #[test]
    fn test_missing_version_line() {
        let raw = member("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", b"");
        assert!(parse_record(&raw).unwrap_err().contains("version"));
    }

    #[test]
    fn test_missing_blank_line() {
        let raw = b"WARC/1.0\r\nWARC-Type: response\r\nContent-Length: 5\r\n".to_vec();
        assert!(parse_record(&raw).unwrap_err().contains("terminator"));
    }

    #[test]
    fn test_missing_content_length() {
        let raw = member("WARC/1.0\r\nWARC-Type: response\r\n\r\n", b"hello");
        assert!(parse_record(&raw).unwrap_err().contains("Content-Length"));
    }

    #[test]
    fn test_short_payload_reported() {
        let raw = b"WARC/1.0\r\nWARC-Type: response\r\nContent-Length: 100\r\n\r\nshort".to_vec();
        assert!(parse_record(&raw).unwrap_err().contains("short payload"));
    }

    #[test]
    fn test_malformed_header_field() {
        let raw = member("WARC/1.0\r\nnot a header line\r\nContent-Length: 0\r\n\r\n", b"");
        assert!(parse_record(&raw).unwrap_err().contains("malformed header field"));
    }
}
