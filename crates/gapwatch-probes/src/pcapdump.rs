//! Pcap side-outputs for offline inspection of a capture.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use pcap_file::pcap::{PcapPacket, PcapWriter};
use thiserror::Error;

use crate::analysis::CapturedPacket;

#[derive(Debug, Error)]
pub enum PcapDumpError {
    #[error("failed to create {path}: {source}")]
    Create {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write pcap: {0}")]
    Write(#[from] pcap_file::PcapError),
}

/// Dump `packets` to a classic pcap file.
pub fn write_pcap(path: &Path, packets: &[CapturedPacket]) -> Result<(), PcapDumpError> {
    let file = File::create(path).map_err(|source| PcapDumpError::Create {
        path: path.display().to_string(),
        source,
    })?;
    let mut writer = PcapWriter::new(BufWriter::new(file))?;
    for pkt in packets {
        writer.write_packet(&PcapPacket::new(
            Duration::from_secs_f64(pkt.time.max(0.0)),
            pkt.data.len() as u32,
            &pkt.data,
        ))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_readable_pcap() {
        let mut path = std::env::temp_dir();
        path.push(format!("gapwatch-pcap-{}.pcap", std::process::id()));

        let packets = vec![
            CapturedPacket {
                time: 1_700_000_000.0,
                data: vec![0u8; 60],
            },
            CapturedPacket {
                time: 1_700_000_000.5,
                data: vec![1u8; 100],
            },
        ];
        write_pcap(&path, &packets).unwrap();

        let file = File::open(&path).unwrap();
        let mut reader = pcap_file::pcap::PcapReader::new(file).unwrap();
        let first = reader.next_packet().unwrap().unwrap();
        assert_eq!(first.data.len(), 60);
        let second = reader.next_packet().unwrap().unwrap();
        assert_eq!(second.data.len(), 100);
        assert!(reader.next_packet().is_none());
        let _ = std::fs::remove_file(&path);
    }
}
