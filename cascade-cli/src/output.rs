use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;

use bytes::Bytes;
use cascade_engine::StreamType;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::CliError;

/// Append every segment the sink accepted to `<dir>/<stream>.mp4`.
///
/// Returns the number of bytes written once the sender side is dropped.
pub async fn write_streams(
    dir: PathBuf,
    mut segments: mpsc::UnboundedReceiver<(StreamType, Bytes)>,
) -> Result<u64, CliError> {
    tokio::fs::create_dir_all(&dir).await?;
    let mut files: HashMap<StreamType, BufWriter<File>> = HashMap::new();
    let mut written = 0u64;

    while let Some((stream, data)) = segments.recv().await {
        let file = match files.entry(stream) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = dir.join(format!("{stream}.mp4"));
                info!(path = %path.display(), "Writing stream");
                entry.insert(BufWriter::new(File::create(&path).await?))
            }
        };
        file.write_all(&data).await?;
        written += data.len() as u64;
    }

    for file in files.values_mut() {
        file.flush().await?;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_segments_land_in_per_stream_files() {
        let dir = std::env::temp_dir().join(format!("cascade-output-{}", std::process::id()));
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send((StreamType::Audio, Bytes::from_static(b"init"))).unwrap();
        tx.send((StreamType::Video, Bytes::from_static(b"v"))).unwrap();
        tx.send((StreamType::Audio, Bytes::from_static(b"frag"))).unwrap();
        drop(tx);

        let written = write_streams(dir.clone(), rx).await.unwrap();
        assert_eq!(written, 9);
        assert_eq!(std::fs::read(dir.join("audio.mp4")).unwrap(), b"initfrag");
        assert_eq!(std::fs::read(dir.join("video.mp4")).unwrap(), b"v");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
