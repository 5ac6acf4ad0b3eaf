use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::queue::advance::{PlaybackError, ResolvedSource, StreamResolver, TempFileGuard};
use crate::queue::Song;

/// Metadata for a track before it enters a queue.
#[derive(Clone, Debug)]
pub struct SongInfo {
    pub title: String,
    pub url: String,
    pub duration: Option<String>,
    pub is_live: bool,
}

#[derive(Deserialize)]
struct YtDlpOutput {
    title: Option<String>,
    duration: Option<f64>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    url: Option<String>,
    is_live: Option<bool>,
}

/// Media resolution backed by a yt-dlp subprocess. Credentials (cookie
/// files) are tried in order; only when every one is rejected does the
/// fatal classification surface.
pub struct YtDlpResolver {
    http: reqwest::Client,
    download_dir: PathBuf,
    download_timeout: Duration,
    cookie_files: Vec<PathBuf>,
}

enum ProbeFailure {
    AgeRestricted,
    AuthRejected(String),
    Transient(String),
    Other(String),
}

impl YtDlpResolver {
    pub fn new(
        http: reqwest::Client,
        download_dir: impl Into<PathBuf>,
        download_timeout: Duration,
        cookie_files: Vec<PathBuf>,
    ) -> Self {
        Self {
            http,
            download_dir: download_dir.into(),
            download_timeout,
            cookie_files,
        }
        .normalized()
    }

    fn normalized(mut self) -> Self {
        if self.cookie_files.is_empty() {
            // A single "no cookies" attempt keeps the credential loop uniform.
            self.cookie_files.push(PathBuf::new());
        }
        self
    }

    /// Probe a URL or free-text query for a playable media URL plus
    /// metadata. Free text becomes a single-result search.
    pub async fn probe(&self, query: &str) -> Result<SongInfo, PlaybackError> {
        let (info, _) = self.probe_with_credentials(query).await?;
        Ok(info)
    }

    /// Search the backend for up to `limit` candidate tracks.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SongInfo>, PlaybackError> {
        let target = format!("ytsearch{limit}:{query}");
        let output = self
            .run_yt_dlp(&target, first_real_cookie(&self.cookie_files))
            .await
            .map_err(probe_to_playback)?;
        Ok(output
            .into_iter()
            .map(|o| o.into_song_info(query))
            .collect())
    }

    async fn probe_with_credentials(
        &self,
        query: &str,
    ) -> Result<(SongInfo, String), PlaybackError> {
        let is_url = query.starts_with("http://") || query.starts_with("https://");
        let target = if is_url {
            query.to_string()
        } else {
            format!("ytsearch1:{query}")
        };

        for cookies in &self.cookie_files {
            let cookie = if cookies.as_os_str().is_empty() {
                None
            } else {
                Some(cookies.as_path())
            };
            match self.run_yt_dlp(&target, cookie).await {
                Ok(mut outputs) if !outputs.is_empty() => {
                    let parsed = outputs.remove(0);
                    // Direct media URL for the decoder; the page URL only
                    // serves as metadata.
                    let media_url = parsed
                        .url
                        .clone()
                        .unwrap_or_else(|| query.to_string());
                    return Ok((parsed.into_song_info(query), media_url));
                }
                Ok(_) => {
                    return Err(PlaybackError::Unrecoverable(format!(
                        "no results for {query}"
                    )))
                }
                Err(ProbeFailure::AgeRestricted) => return Err(PlaybackError::AgeRestricted),
                Err(ProbeFailure::AuthRejected(detail)) => {
                    warn!("credential rejected by media backend: {}", detail);
                    continue;
                }
                Err(ProbeFailure::Transient(detail)) => {
                    return Err(PlaybackError::Transient(detail))
                }
                Err(ProbeFailure::Other(detail)) => {
                    return Err(PlaybackError::Unrecoverable(detail))
                }
            }
        }
        Err(PlaybackError::CredentialsExhausted)
    }

    async fn run_yt_dlp(
        &self,
        target: &str,
        cookies: Option<&std::path::Path>,
    ) -> Result<Vec<YtDlpOutput>, ProbeFailure> {
        let mut cmd = Command::new("yt-dlp");
        cmd.args(["-j", "-f", "bestaudio", "--no-playlist", "--no-warnings"]);
        if let Some(path) = cookies {
            cmd.arg("--cookies").arg(path);
        }
        cmd.arg(target);

        let output = cmd
            .output()
            .await
            .map_err(|e| ProbeFailure::Transient(format!("yt-dlp spawn failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(classify_stderr(&stderr));
        }

        let mut parsed = Vec::new();
        for line in output.stdout.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let entry: YtDlpOutput = serde_json::from_slice(line)
                .map_err(|e| ProbeFailure::Other(format!("unparseable yt-dlp output: {e}")))?;
            parsed.push(entry);
        }
        Ok(parsed)
    }

    /// Seeking into a live stream needs a seekable input: download up to the
    /// timeout into a temp file the decoder can seek in. The guard deletes
    /// the file once decoding is done with it.
    async fn buffer_to_file(&self, media_url: &str) -> Result<ResolvedSource, PlaybackError> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| PlaybackError::Unrecoverable(format!("download dir: {e}")))?;

        let path = self.download_dir.join(format!(
            "buffer-{}-{}.webm",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        ));

        let download = async {
            let mut response = self
                .http
                .get(media_url)
                .send()
                .await
                .map_err(|e| PlaybackError::Transient(format!("buffer request: {e}")))?;
            let mut file = tokio::fs::File::create(&path)
                .await
                .map_err(|e| PlaybackError::Unrecoverable(format!("buffer file: {e}")))?;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| PlaybackError::Transient(format!("buffer read: {e}")))?
            {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| PlaybackError::Unrecoverable(format!("buffer write: {e}")))?;
            }
            file.flush()
                .await
                .map_err(|e| PlaybackError::Unrecoverable(format!("buffer flush: {e}")))?;
            Ok::<(), PlaybackError>(())
        };

        match tokio::time::timeout(self.download_timeout, download).await {
            Ok(Ok(())) => {}
            // Timeout is not fatal: whatever arrived is seekable.
            Err(_) => debug!("live-stream buffering hit the download timeout, using partial file"),
            Ok(Err(e)) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        }

        Ok(ResolvedSource::File {
            path: path.clone(),
            temp: Some(TempFileGuard(path)),
        })
    }
}

#[async_trait]
impl StreamResolver for YtDlpResolver {
    async fn resolve(&self, song: &Song, seek: Duration) -> Result<ResolvedSource, PlaybackError> {
        let (_, media_url) = self.probe_with_credentials(&song.url).await?;

        if song.is_live && !seek.is_zero() {
            return self.buffer_to_file(&media_url).await;
        }
        Ok(ResolvedSource::Remote { url: media_url })
    }
}

impl YtDlpOutput {
    fn into_song_info(self, fallback_url: &str) -> SongInfo {
        let duration = self.duration.map(|d| {
            let secs = d as u64;
            format!("{}:{:02}", secs / 60, secs % 60)
        });
        SongInfo {
            title: self.title.unwrap_or_else(|| "unknown".to_string()),
            url: self
                .webpage_url
                .or(self.original_url)
                .or(self.url)
                .unwrap_or_else(|| fallback_url.to_string()),
            duration,
            is_live: self.is_live.unwrap_or(false),
        }
    }
}

fn first_real_cookie(cookie_files: &[PathBuf]) -> Option<&std::path::Path> {
    cookie_files
        .iter()
        .find(|p| !p.as_os_str().is_empty())
        .map(|p| p.as_path())
}

fn classify_stderr(stderr: &str) -> ProbeFailure {
    let lower = stderr.to_lowercase();
    if lower.contains("age") && (lower.contains("restrict") || lower.contains("confirm")) {
        ProbeFailure::AgeRestricted
    } else if lower.contains("sign in") || lower.contains("cookies") || lower.contains("account") {
        ProbeFailure::AuthRejected(stderr.trim().to_string())
    } else if lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("temporary")
        || lower.contains("unable to download")
    {
        ProbeFailure::Transient(stderr.trim().to_string())
    } else {
        ProbeFailure::Other(stderr.trim().to_string())
    }
}

fn probe_to_playback(failure: ProbeFailure) -> PlaybackError {
    match failure {
        ProbeFailure::AgeRestricted => PlaybackError::AgeRestricted,
        ProbeFailure::AuthRejected(d) => PlaybackError::Unrecoverable(d),
        ProbeFailure::Transient(d) => PlaybackError::Transient(d),
        ProbeFailure::Other(d) => PlaybackError::Unrecoverable(d),
    }
}
