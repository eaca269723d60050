//! WAV encoding for synthesized PCM

use std::path::Path;

use crate::{Error, Result};

/// Wrap 16-bit little-endian mono PCM in a WAV container
///
/// A trailing odd byte is ignored.
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Write PCM to a WAV file
///
/// # Errors
///
/// Returns error if encoding or writing fails
pub fn write_wav(path: &Path, pcm: &[u8], sample_rate: u32) -> Result<()> {
    std::fs::write(path, pcm_to_wav(pcm, sample_rate)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_pcm_samples() {
        let samples: [i16; 4] = [0, 1000, -1000, i16::MAX];
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let wav = pcm_to_wav(&pcm, 24000).unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();

        assert_eq!(reader.spec().sample_rate, 24000);
        assert_eq!(reader.spec().channels, 1);
        let decoded: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn ignores_trailing_odd_byte() {
        let wav = pcm_to_wav(&[1, 0, 7], 16000).unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        assert_eq!(reader.len(), 1);
    }

    #[test]
    fn writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reply.wav");
        write_wav(&path, &[0; 8], 16000).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 8);
    }
}
