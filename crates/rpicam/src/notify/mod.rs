//! Best-effort notifications about finished and failed jobs.

mod telegram;

pub use telegram::TelegramPoster;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::callback::{Callback, Context, ExecPoint};
use crate::error::Result;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Could not find Telegram credentials (set {0} and {1})")]
    MissingCredentials(&'static str, &'static str),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sink for job notifications.
pub trait Notifier: Send + Sync {
    fn send_video(&self, path: &Path) -> std::result::Result<(), NotifyError>;

    fn send_text(&self, text: &str) -> std::result::Result<(), NotifyError>;
}

/// Uploads the converted video.
pub struct PostToTelegram {
    notifier: Arc<dyn Notifier>,
}

impl PostToTelegram {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

impl Callback for PostToTelegram {
    fn exec_at(&self) -> ExecPoint {
        ExecPoint::AfterConvert
    }

    fn name(&self) -> &str {
        "post_to_telegram"
    }

    fn call(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        if let Context::Output(path) = ctx {
            match self.notifier.send_video(path) {
                Ok(()) => log::info!("[notify] Uploaded {}", path.display()),
                Err(e) => log::error!("[notify] Could not upload {}: {}", path.display(), e),
            }
        }
        Ok(())
    }
}

/// Sends the text of a job's error.
pub struct SendExceptionToTelegram {
    notifier: Arc<dyn Notifier>,
}

impl SendExceptionToTelegram {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

impl Callback for SendExceptionToTelegram {
    fn exec_at(&self) -> ExecPoint {
        ExecPoint::OnException
    }

    fn name(&self) -> &str {
        "send_exception_to_telegram"
    }

    fn call(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        if let Context::Error(err) = ctx {
            let text = format!("rpicam job failed: {err}");
            if let Err(e) = self.notifier.send_text(&text) {
                log::error!("[notify] Could not send error report: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackRegistry;
    use crate::error::Error;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        videos: Mutex<Vec<PathBuf>>,
        texts: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Notifier for Recorded {
        fn send_video(&self, path: &Path) -> std::result::Result<(), NotifyError> {
            self.videos.lock().unwrap().push(path.to_path_buf());
            if self.fail {
                return Err(NotifyError::FileNotFound(path.to_path_buf()));
            }
            Ok(())
        }

        fn send_text(&self, text: &str) -> std::result::Result<(), NotifyError> {
            self.texts.lock().unwrap().push(text.to_string());
            if self.fail {
                return Err(NotifyError::Api {
                    status: 500,
                    body: "down".to_string(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_posts_video_after_convert() {
        let notifier = Arc::new(Recorded::default());
        let mut registry = CallbackRegistry::new();
        registry.register(PostToTelegram::new(notifier.clone()));

        let out = PathBuf::from("/tmp/out.mp4");
        registry
            .dispatch(ExecPoint::AfterConvert, &mut Context::Output(&out))
            .unwrap();
        assert_eq!(*notifier.videos.lock().unwrap(), vec![out]);
    }

    #[test]
    fn test_delivery_failures_are_swallowed() {
        let notifier = Arc::new(Recorded {
            fail: true,
            ..Default::default()
        });
        let mut registry = CallbackRegistry::new();
        registry
            .register(PostToTelegram::new(notifier.clone()))
            .register(SendExceptionToTelegram::new(notifier.clone()));

        let out = PathBuf::from("/tmp/out.mp4");
        registry
            .dispatch(ExecPoint::AfterConvert, &mut Context::Output(&out))
            .unwrap();
        let err = registry.dispatch_and_raise(Error::Encoder("ffmpeg crashed".to_string()));

        assert!(matches!(err, Error::Encoder(_)));
        let texts = notifier.texts.lock().unwrap();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("ffmpeg crashed"), "{}", texts[0]);
    }
}
