use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::CaptureError;

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// One JPEG of the primary display.
    async fn capture(&self) -> Result<Vec<u8>, CaptureError>;
}

/// Screenshot via the platform's command-line tool, written to a temp JPEG.
#[derive(Debug, Default)]
pub struct ShellScreenCapture;

async fn run(program: &str, args: &[&str]) -> bool {
    match Command::new(program).args(args).output().await {
        Ok(out) if out.status.success() => true,
        Ok(out) => {
            debug!(target: "dispatch", program, status = ?out.status, "screen capture tool failed");
            false
        }
        Err(e) => {
            debug!(target: "dispatch", program, "screen capture tool not runnable: {}", e);
            false
        }
    }
}

async fn capture_to(path: &Path) -> bool {
    let target = path.to_string_lossy().to_string();
    if cfg!(target_os = "macos") {
        run("screencapture", &["-x", "-t", "jpg", &target]).await
    } else if cfg!(target_os = "windows") {
        let script = format!(
            "Add-Type -AssemblyName System.Windows.Forms,System.Drawing; \
             $b=[System.Windows.Forms.Screen]::PrimaryScreen.Bounds; \
             $bmp=New-Object System.Drawing.Bitmap $b.Width,$b.Height; \
             $g=[System.Drawing.Graphics]::FromImage($bmp); \
             $g.CopyFromScreen($b.Location,[System.Drawing.Point]::Empty,$b.Size); \
             $bmp.Save('{}',[System.Drawing.Imaging.ImageFormat]::Jpeg)",
            target.replace('\'', "''")
        );
        run("powershell", &["-NoProfile", "-NonInteractive", "-Command", &script]).await
    } else {
        run("gnome-screenshot", &["-f", &target]).await || run("import", &["-window", "root", &target]).await
    }
}

#[async_trait]
impl ScreenCapture for ShellScreenCapture {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        let path = std::env::temp_dir().join(format!("sentinel-shot-{}.jpg", uuid::Uuid::new_v4().simple()));
        let ok = capture_to(&path).await;
        let bytes = if ok { tokio::fs::read(&path).await.ok() } else { None };
        let _ = tokio::fs::remove_file(&path).await;
        match bytes {
            Some(b) if !b.is_empty() => Ok(b),
            _ => Err(CaptureError::Failed("no screenshot tool produced an image".into())),
        }
    }
}
