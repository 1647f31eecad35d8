use bytes::{BufMut, Bytes, BytesMut};

/// H.264 NAL unit types
pub mod h264 {
    pub const NAL_IDR: u8 = 5;
    pub const NAL_SPS: u8 = 7;
    pub const NAL_PPS: u8 = 8;
    pub const NAL_AUD: u8 = 9;

    pub fn nal_type(nal: &[u8]) -> u8 {
        nal.first().map(|b| b & 0x1f).unwrap_or(0)
    }
}

/// H.265 NAL unit types
pub mod h265 {
    pub const NAL_IDR_W_RADL: u8 = 19;
    pub const NAL_IDR_N_LP: u8 = 20;
    pub const NAL_CRA: u8 = 21;
    pub const NAL_VPS: u8 = 32;
    pub const NAL_SPS: u8 = 33;
    pub const NAL_PPS: u8 = 34;

    pub fn nal_type(nal: &[u8]) -> u8 {
        nal.first().map(|b| (b >> 1) & 0x3f).unwrap_or(0)
    }
}

/// Video codec parameter sets (SPS/PPS/VPS), kept alongside sample rings so
/// new consumers can decode from any retained keyframe even after the sample
/// that carried the parameters was evicted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodecParams {
    pub vps: Vec<Bytes>,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl CodecParams {
    pub fn is_empty(&self) -> bool {
        self.sps.is_empty() && self.pps.is_empty() && self.vps.is_empty()
    }

    /// Serialize back to an Annex-B prefix suitable for prepending to an IDR
    pub fn to_annexb(&self) -> Bytes {
        let mut out = BytesMut::new();
        for nal in self.vps.iter().chain(&self.sps).chain(&self.pps) {
            out.put_slice(&[0, 0, 0, 1]);
            out.put_slice(nal);
        }
        out.freeze()
    }
}

/// Split an Annex-B buffer into NAL unit payloads (start codes stripped)
pub fn annexb_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut i = 0;
    let mut start: Option<usize> = None;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                nals.push(&data[s..code_start]);
            }
            i += 3;
            start = Some(i);
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        nals.push(&data[s..]);
    }
    nals
}

fn is_h264_codec(codec: &str) -> bool {
    codec == "h264"
}

fn is_h265_codec(codec: &str) -> bool {
    codec == "h265" || codec == "hevc"
}

/// Whether an Annex-B access unit is independently decodable
pub fn is_keyframe(codec: &str, data: &[u8]) -> bool {
    for nal in annexb_nal_units(data) {
        if is_h264_codec(codec) && h264::nal_type(nal) == h264::NAL_IDR {
            return true;
        }
        if is_h265_codec(codec) {
            let t = h265::nal_type(nal);
            if t == h265::NAL_IDR_W_RADL || t == h265::NAL_IDR_N_LP || t == h265::NAL_CRA {
                return true;
            }
        }
    }
    false
}

/// Pull parameter-set NALs out of an access unit, if any are present
pub fn extract_params(codec: &str, data: &[u8]) -> Option<CodecParams> {
    let mut params = CodecParams::default();
    for nal in annexb_nal_units(data) {
        if is_h264_codec(codec) {
            match h264::nal_type(nal) {
                h264::NAL_SPS => params.sps.push(Bytes::copy_from_slice(nal)),
                h264::NAL_PPS => params.pps.push(Bytes::copy_from_slice(nal)),
                _ => {}
            }
        } else if is_h265_codec(codec) {
            match h265::nal_type(nal) {
                h265::NAL_VPS => params.vps.push(Bytes::copy_from_slice(nal)),
                h265::NAL_SPS => params.sps.push(Bytes::copy_from_slice(nal)),
                h265::NAL_PPS => params.pps.push(Bytes::copy_from_slice(nal)),
                _ => {}
            }
        }
    }
    if params.is_empty() {
        None
    } else {
        Some(params)
    }
}

/// Whether the access unit already carries in-band parameter sets
pub fn contains_parameter_sets(codec: &str, data: &[u8]) -> bool {
    annexb_nal_units(data).iter().any(|nal| {
        if is_h264_codec(codec) {
            h264::nal_type(nal) == h264::NAL_SPS
        } else if is_h265_codec(codec) {
            h265::nal_type(nal) == h265::NAL_SPS
        } else {
            false
        }
    })
}

/// Convert an Annex-B access unit to 4-byte length-prefixed form (MP4 sample)
pub fn annexb_to_length_prefixed(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 8);
    for nal in annexb_nal_units(data) {
        out.put_u32(nal.len() as u32);
        out.put_slice(nal);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn test_nal_split() {
        let data = annexb(&[&[0x67, 1, 2], &[0x68, 3], &[0x65, 4, 5, 6]]);
        let nals = annexb_nal_units(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0], &[0x67, 1, 2]);
        assert_eq!(nals[2], &[0x65, 4, 5, 6]);
    }

    #[test]
    fn test_three_byte_start_codes() {
        let mut data = vec![0, 0, 1, 0x67, 1];
        data.extend_from_slice(&[0, 0, 1, 0x65, 2]);
        let nals = annexb_nal_units(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x67, 1]);
        assert_eq!(nals[1], &[0x65, 2]);
    }

    #[test]
    fn test_h264_keyframe_detection() {
        let idr = annexb(&[&[0x65, 0xaa]]);
        let non_idr = annexb(&[&[0x41, 0xaa]]);
        assert!(is_keyframe("h264", &idr));
        assert!(!is_keyframe("h264", &non_idr));
    }

    #[test]
    fn test_h265_keyframe_detection() {
        // nal type 19 (IDR_W_RADL) = (19 << 1) in the first header byte
        let idr = annexb(&[&[19 << 1, 0x01, 0xaa]]);
        // nal type 1 (TRAIL_R)
        let trail = annexb(&[&[1 << 1, 0x01, 0xaa]]);
        assert!(is_keyframe("hevc", &idr));
        assert!(!is_keyframe("hevc", &trail));
    }

    #[test]
    fn test_param_extraction() {
        let data = annexb(&[&[0x67, 1, 2], &[0x68, 3], &[0x65, 4]]);
        let params = extract_params("h264", &data).unwrap();
        assert_eq!(params.sps.len(), 1);
        assert_eq!(params.pps.len(), 1);
        assert!(params.vps.is_empty());
        assert!(contains_parameter_sets("h264", &data));

        let idr_only = annexb(&[&[0x65, 4]]);
        assert!(extract_params("h264", &idr_only).is_none());
        assert!(!contains_parameter_sets("h264", &idr_only));
    }

    #[test]
    fn test_annexb_to_length_prefixed() {
        let data = annexb(&[&[0x65, 1, 2, 3]]);
        let avcc = annexb_to_length_prefixed(&data);
        assert_eq!(&avcc[..], &[0, 0, 0, 4, 0x65, 1, 2, 3]);
    }

    #[test]
    fn test_params_to_annexb_roundtrip() {
        let data = annexb(&[&[0x67, 1], &[0x68, 2]]);
        let params = extract_params("h264", &data).unwrap();
        let rendered = params.to_annexb();
        let nals = annexb_nal_units(&rendered);
        assert_eq!(nals.len(), 2);
        assert_eq!(h264::nal_type(nals[0]), h264::NAL_SPS);
        assert_eq!(h264::nal_type(nals[1]), h264::NAL_PPS);
    }
}
