//! Deserialize data from the wire protocol.
use bytes::Bytes;
use nom::{
    IResult,
    bytes::complete::take,
    number::complete::{be_f32, be_f64, be_i8, be_i16, be_i32, be_u8, be_u16, be_u64},
};
use nombytes::NomBytes;

use crate::types::{Generation, LoadReport, RegionPos, ServerId};

/// Convert bytes to a validated UTF-8 string.
/// Returns an error if the bytes are not valid UTF-8.
pub fn bytes_to_string(bytes: &Bytes) -> Result<String, nom::Err<nom::error::Error<NomBytes>>> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| {
            nom::Err::Failure(nom::error::Error::new(
                NomBytes::from(bytes.as_ref()),
                nom::error::ErrorKind::Verify,
            ))
        })
}

/// Parse a u16-length-prefixed string as raw bytes.
pub fn parse_string(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_u16(s)?;
    let (s, string) = take(length)(s)?;
    Ok((s, string.into_bytes()))
}

/// Parse a u16-length-prefixed string as a ServerId, validating UTF-8.
pub fn parse_server_id(s: NomBytes) -> IResult<NomBytes, ServerId> {
    let (s, raw) = parse_string(s)?;
    let id = bytes_to_string(&raw)?;
    Ok((s, ServerId::from(id)))
}

/// Parse an i16-length-prefixed nullable string; -1 encodes null.
pub fn parse_nullable_string(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = be_i16(s)?;

    // Null string
    if length == -1 {
        return Ok((s, None));
    }

    if length < 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::Verify,
        )));
    }

    let (s, string) = take(length as u16)(s)?;
    Ok((s, Some(string.into_bytes())))
}

/// Parse a nullable ServerId.
pub fn parse_nullable_server_id(s: NomBytes) -> IResult<NomBytes, Option<ServerId>> {
    let (s, raw) = parse_nullable_string(s)?;
    match raw {
        Some(raw) => {
            let id = bytes_to_string(&raw)?;
            Ok((s, Some(ServerId::from(id))))
        }
        None => Ok((s, None)),
    }
}

/// Parse an i32-length-prefixed byte blob.
pub fn parse_bytes(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_i32(s)?;

    if length < 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::Verify,
        )));
    }

    let (s, blob) = take(length as u32)(s)?;
    Ok((s, blob.into_bytes()))
}

/// Parse a region coordinate pair.
pub fn parse_region(s: NomBytes) -> IResult<NomBytes, RegionPos> {
    let (s, x) = be_i32(s)?;
    let (s, z) = be_i32(s)?;
    Ok((s, RegionPos::new(x, z)))
}

/// Parse an optional region behind a one-byte presence flag.
pub fn parse_optional_region(s: NomBytes) -> IResult<NomBytes, Option<RegionPos>> {
    let (s, present) = be_i8(s)?;
    if present == 0 {
        return Ok((s, None));
    }
    let (s, region) = parse_region(s)?;
    Ok((s, Some(region)))
}

/// Parse a generation fencing token.
pub fn parse_generation(s: NomBytes) -> IResult<NomBytes, Generation> {
    let (s, raw) = be_u64(s)?;
    Ok((s, Generation::new(raw)))
}

/// Parse the load sample carried by a Heartbeat.
pub fn parse_load_report(s: NomBytes) -> IResult<NomBytes, LoadReport> {
    let (s, tick_millis) = be_f64(s)?;
    let (s, tps) = be_f32(s)?;
    let (s, owned_regions) = be_u64(s)?;
    Ok((
        s,
        LoadReport {
            tick_millis,
            tps,
            owned_regions,
        },
    ))
}

/// Parse the one-byte message kind tag.
pub fn parse_kind(s: NomBytes) -> IResult<NomBytes, u8> {
    be_u8(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_string_valid_utf8() {
        let bytes = Bytes::from("hello");
        let result = bytes_to_string(&bytes);
        assert_eq!(result.unwrap(), "hello");
    }

    #[test]
    fn test_bytes_to_string_invalid_utf8() {
        let bytes = Bytes::from(vec![0xff, 0xfe]);
        let result = bytes_to_string(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_string() {
        let mut data = Vec::new();
        data.extend_from_slice(&5u16.to_be_bytes());
        data.extend_from_slice(b"hello");
        data.extend_from_slice(b"extra");

        let (rest, parsed) = parse_string(NomBytes::new(Bytes::from(data))).unwrap();
        assert_eq!(parsed, Bytes::from("hello"));
        assert_eq!(rest.into_bytes(), Bytes::from("extra"));
    }

    #[test]
    fn test_parse_nullable_string_null() {
        let data = (-1i16).to_be_bytes().to_vec();
        let (_, parsed) = parse_nullable_string(NomBytes::new(Bytes::from(data))).unwrap();
        assert_eq!(parsed, None);
    }

    #[test]
    fn test_parse_nullable_string_negative_length_rejected() {
        let data = (-2i16).to_be_bytes().to_vec();
        assert!(parse_nullable_string(NomBytes::new(Bytes::from(data))).is_err());
    }

    #[test]
    fn test_parse_region_roundtrip() {
        let mut data = Vec::new();
        data.extend_from_slice(&(-3i32).to_be_bytes());
        data.extend_from_slice(&7i32.to_be_bytes());

        let (_, region) = parse_region(NomBytes::new(Bytes::from(data))).unwrap();
        assert_eq!(region, RegionPos::new(-3, 7));
    }

    #[test]
    fn test_parse_optional_region_absent() {
        let data = vec![0u8];
        let (_, region) = parse_optional_region(NomBytes::new(Bytes::from(data))).unwrap();
        assert_eq!(region, None);
    }

    #[test]
    fn test_parse_load_report() {
        let mut data = Vec::new();
        data.extend_from_slice(&42.5f64.to_be_bytes());
        data.extend_from_slice(&19.8f32.to_be_bytes());
        data.extend_from_slice(&12u64.to_be_bytes());

        let (_, report) = parse_load_report(NomBytes::new(Bytes::from(data))).unwrap();
        assert_eq!(report.tick_millis, 42.5);
        assert_eq!(report.tps, 19.8);
        assert_eq!(report.owned_regions, 12);
    }

    #[test]
    fn test_parse_bytes_truncated_blob() {
        let mut data = Vec::new();
        data.extend_from_slice(&10i32.to_be_bytes());
        data.extend_from_slice(b"short");

        assert!(parse_bytes(NomBytes::new(Bytes::from(data))).is_err());
    }
}
