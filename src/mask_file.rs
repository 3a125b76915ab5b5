//! Mask configuration files and host requests written to processors.
//!
//! A mask file is a capture of the requests a host tool sends to configure
//! logging, one framed request after another. HDLC files hold escaped frames
//! ending in `0x7E` with a CRC; non-HDLC files hold
//! `[0x7E][1][len:u16][request][0x7E]` frames. Each request is unframed and
//! written as a raw request for the target processor:
//!
//! ```text
//! USER_SPACE_RAW_DATA:u32 [token:i32 if remote] request
//! ```
//!
//! A mask list file names several mask files, one `proc_type path` pair per
//! line. Lines starting with `;` are comments.

use std::path::{Path, PathBuf};

use bytes::BufMut;

use crate::codec::hdlc::{self, CONTROL_CHAR};
use crate::error::{DiagError, Result};
use crate::protocol::stream::{
    NUM_PROC, TOKEN_LIST, USER_SPACE_DATA_TYPE, USER_SPACE_RAW_DATA_TYPE,
};
use crate::protocol::{FrameBuffer, Framing};
use crate::transport::Device;

/// Mask file name used with HDLC framing.
pub const MASK_FILE_NAME: &str = "Diag.cfg";

/// Mask file name used without HDLC framing.
pub const MASK_FILE_NAME_NON_HDLC: &str = "Diag.cfg2";

/// `<dir>/Diag.cfg` or `<dir>/Diag.cfg2`.
pub fn default_mask_file(dir: &Path, hdlc_enabled: bool) -> PathBuf {
    if hdlc_enabled {
        dir.join(MASK_FILE_NAME)
    } else {
        dir.join(MASK_FILE_NAME_NON_HDLC)
    }
}

/// Write `data` for processor `proc` under stream type `tag`.
///
/// `tag` is [`USER_SPACE_RAW_DATA_TYPE`] for an unframed request or
/// [`USER_SPACE_DATA_TYPE`] for one still carrying its HDLC framing.
pub fn send_data(device: &dyn Device, tag: u32, proc: usize, data: &[u8]) -> Result<()> {
    if tag != USER_SPACE_RAW_DATA_TYPE && tag != USER_SPACE_DATA_TYPE {
        return Err(DiagError::InvalidParameter(format!("send data type {:#x}", tag)));
    }
    if proc >= NUM_PROC {
        return Err(DiagError::InvalidProcessor(proc as i32));
    }
    if data.is_empty() {
        return Err(DiagError::InvalidParameter("empty request".into()));
    }
    if !device.is_open() {
        return Err(DiagError::DeviceClosed);
    }
    let mut buf = Vec::with_capacity(data.len() + 8);
    buf.put_u32_le(tag);
    if proc > 0 {
        buf.put_i32_le(TOKEN_LIST[proc]);
    }
    buf.put_slice(data);
    device.write(&buf)
}

/// Unframe every request of a mask file image.
///
/// Fails if a frame is corrupt or the image holds no request at all.
pub fn parse_mask_file(data: &[u8], framing: Framing) -> Result<Vec<Vec<u8>>> {
    let requests = match framing {
        Framing::Hdlc => {
            let mut requests = Vec::new();
            for frame in data.split_inclusive(|&b| b == CONTROL_CHAR) {
                if frame.last() != Some(&CONTROL_CHAR) {
                    tracing::warn!(
                        "Ignoring {} unterminated bytes at end of mask file",
                        frame.len()
                    );
                    continue;
                }
                if frame.len() == 1 {
                    continue;
                }
                requests.push(hdlc::decode(frame)?);
            }
            requests
        }
        Framing::NonHdlc => {
            if data.first().is_some_and(|&b| b != CONTROL_CHAR) {
                return Err(DiagError::Malformed(
                    "mask file does not start with a frame".into(),
                ));
            }
            let mut frames = FrameBuffer::new(Framing::NonHdlc);
            let requests = frames.push(data);
            if !frames.is_empty() {
                tracing::warn!("Ignoring {} trailing bytes of mask file", frames.len());
            }
            requests
        }
    };
    if requests.is_empty() {
        return Err(DiagError::Malformed("no requests in mask file".into()));
    }
    Ok(requests)
}

/// Send every request of the mask file at `path` to processor `proc`.
/// Returns the number of requests written.
pub fn read_mask_file(
    device: &dyn Device,
    path: &Path,
    proc: usize,
    framing: Framing,
) -> Result<usize> {
    let data = std::fs::read(path).map_err(|e| {
        tracing::error!("Can't open mask file {}: {}", path.display(), e);
        e
    })?;
    let requests = parse_mask_file(&data, framing)?;
    for request in &requests {
        send_data(device, USER_SPACE_RAW_DATA_TYPE, proc, request)?;
    }
    tracing::info!(
        "Mask file {} sent {} requests to processor {}",
        path.display(),
        requests.len(),
        proc
    );
    Ok(requests.len())
}

/// One line of a mask list file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskListEntry {
    pub proc: usize,
    pub path: PathBuf,
}

/// Parse a mask list. Malformed lines are logged and skipped.
pub fn parse_mask_list(text: &str) -> Vec<MaskListEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        if line.starts_with(';') || line.trim().is_empty() {
            continue;
        }
        let line = line.trim_start();
        let digits = line
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(line.len());
        let (number, rest) = line.split_at(digits);
        let proc = match parse_proc(number) {
            Some(proc) if proc < NUM_PROC - 1 => proc,
            _ => {
                tracing::warn!("Skipping mask list line, bad processor type: {}", line);
                continue;
            }
        };
        let name: String = rest
            .trim_start_matches(' ')
            .chars()
            .take_while(|c| *c != ';' && *c != ' ' && !c.is_control())
            .collect();
        if name.is_empty() {
            tracing::warn!("Skipping mask list line, no file name: {}", line);
            continue;
        }
        entries.push(MaskListEntry {
            proc,
            path: PathBuf::from(name),
        });
    }
    entries
}

fn parse_proc(number: &str) -> Option<usize> {
    match number.strip_prefix("0x").or_else(|| number.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => number.parse().ok(),
    }
}

/// Read every mask file named by the list at `list`. Returns how many were
/// sent successfully; failing files are logged and skipped.
pub fn read_mask_file_list(device: &dyn Device, list: &Path, framing: Framing) -> Result<usize> {
    let text = std::fs::read_to_string(list)?;
    let mut read = 0;
    for entry in parse_mask_list(&text) {
        match read_mask_file(device, &entry.path, entry.proc, framing) {
            Ok(_) => read += 1,
            Err(e) => tracing::error!("Error reading mask file {}: {}", entry.path.display(), e),
        }
    }
    tracing::info!("Read {} mask files from {}", read, list.display());
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::non_hdlc_frame;
    use crate::transport::LoopbackDevice;

    fn le32(b: &[u8]) -> u32 {
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    #[test]
    fn test_parse_hdlc_mask_file() {
        let mut image = hdlc::encode(&[0x7d, 0x05, 0x7e]);
        image.extend_from_slice(&hdlc::encode(&[0x73, 0, 0, 0]));
        image.push(CONTROL_CHAR);

        let requests = parse_mask_file(&image, Framing::Hdlc).unwrap();
        assert_eq!(requests, vec![vec![0x7d, 0x05, 0x7e], vec![0x73, 0, 0, 0]]);
    }

    #[test]
    fn test_parse_rejects_corrupt_or_empty() {
        let mut frame = hdlc::encode(&[0x4b, 1, 2]);
        frame[1] ^= 0xff;
        assert!(matches!(
            parse_mask_file(&frame, Framing::Hdlc),
            Err(DiagError::Malformed(_))
        ));
        assert!(parse_mask_file(b"no frames", Framing::Hdlc).is_err());
        assert!(parse_mask_file(&[], Framing::NonHdlc).is_err());
        assert!(parse_mask_file(&[0x4b, 0x7e], Framing::NonHdlc).is_err());
    }

    #[test]
    fn test_parse_non_hdlc_mask_file() {
        let mut image = non_hdlc_frame(&[0x7d, 0x01]);
        image.extend_from_slice(&non_hdlc_frame(&[0x82, 0, 0, 0]));
        let requests = parse_mask_file(&image, Framing::NonHdlc).unwrap();
        assert_eq!(requests, vec![vec![0x7d, 0x01], vec![0x82, 0, 0, 0]]);
    }

    #[test]
    fn test_read_mask_file_writes_raw_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_mask_file(dir.path(), true);
        let mut image = hdlc::encode(&[0x7d, 0x05]);
        image.extend_from_slice(&hdlc::encode(&[0x73, 3]));
        std::fs::write(&path, &image).unwrap();

        let device = LoopbackDevice::new();
        assert_eq!(read_mask_file(&device, &path, 0, Framing::Hdlc).unwrap(), 2);
        assert_eq!(read_mask_file(&device, &path, 1, Framing::Hdlc).unwrap(), 2);

        let written = device.written();
        assert_eq!(written.len(), 4);
        assert_eq!(le32(&written[0]), USER_SPACE_RAW_DATA_TYPE);
        assert_eq!(&written[0][4..], &[0x7d, 0x05]);
        assert_eq!(&written[2][4..8], &(-1i32).to_le_bytes());
        assert_eq!(&written[3][8..], &[0x73, 3]);
    }

    #[test]
    fn test_missing_mask_file() {
        let dir = tempfile::tempdir().unwrap();
        let device = LoopbackDevice::new();
        let path = default_mask_file(dir.path(), false);
        assert!(path.ends_with("Diag.cfg2"));
        assert!(matches!(
            read_mask_file(&device, &path, 0, Framing::NonHdlc),
            Err(DiagError::Io(_))
        ));
        assert!(device.written().is_empty());
    }

    #[test]
    fn test_parse_mask_list() {
        let text = "; comment\n\
                    0 /data/Diag.cfg\n\
                    1   /data/mdm/Diag.cfg ; trailing\n\
                    0x2 /data/mdm2.cfg\n\
                    9 /data/bad_proc.cfg\n\
                    x /data/no_proc.cfg\n\
                    0\n";
        let entries = parse_mask_list(text);
        assert_eq!(
            entries,
            vec![
                MaskListEntry { proc: 0, path: PathBuf::from("/data/Diag.cfg") },
                MaskListEntry { proc: 1, path: PathBuf::from("/data/mdm/Diag.cfg") },
                MaskListEntry { proc: 2, path: PathBuf::from("/data/mdm2.cfg") },
            ]
        );
    }

    #[test]
    fn test_read_mask_file_list_counts_successes() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.cfg");
        std::fs::write(&good, hdlc::encode(&[0x7d, 0x05])).unwrap();
        let list = dir.path().join("list.txt");
        std::fs::write(
            &list,
            format!(
                "0 {}\n1 {}\n",
                good.display(),
                dir.path().join("missing.cfg").display()
            ),
        )
        .unwrap();

        let device = LoopbackDevice::new();
        assert_eq!(read_mask_file_list(&device, &list, Framing::Hdlc).unwrap(), 1);
        assert_eq!(device.written().len(), 1);
    }

    #[test]
    fn test_send_data_validation() {
        let device = LoopbackDevice::new();
        send_data(&device, USER_SPACE_DATA_TYPE, 5, &[1, 2]).unwrap();
        let frame = device.take_written().remove(0);
        assert_eq!(le32(&frame), USER_SPACE_DATA_TYPE);
        assert_eq!(&frame[4..8], &(-5i32).to_le_bytes());
        assert_eq!(&frame[8..], &[1, 2]);

        assert!(matches!(
            send_data(&device, USER_SPACE_RAW_DATA_TYPE, NUM_PROC, &[1]),
            Err(DiagError::InvalidProcessor(_))
        ));
        assert!(send_data(&device, USER_SPACE_RAW_DATA_TYPE, 0, &[]).is_err());
        assert!(send_data(&device, 0x40, 0, &[1]).is_err());
        assert!(device.written().is_empty());
    }
}
