//! Detector adapter that drives an external model process over stdio.
//!
//! The child announces itself with `{"ready":true,"dimension":N}`. Each
//! request is a JSON header line followed by `width * height` raw gray
//! bytes; each reply is one JSON line with pixel-space boxes.

use serde::Deserialize;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tatami_core::{DetectedFace, Descriptor, Detector, DetectorError, FaceBox};

#[derive(Deserialize)]
struct Handshake {
    ready: bool,
    #[serde(default)]
    dimension: usize,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Response {
    Faces { faces: Vec<RawFace> },
    Error { error: String },
}

#[derive(Deserialize)]
struct RawFace {
    #[serde(rename = "box")]
    bbox: RawBox,
    descriptor: Vec<f32>,
}

#[derive(Deserialize)]
struct RawBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

fn parse_handshake(line: &str) -> Result<usize, DetectorError> {
    let handshake: Handshake = serde_json::from_str(line)
        .map_err(|e| DetectorError::InvalidOutput(format!("handshake: {e}")))?;
    if !handshake.ready {
        return Err(DetectorError::Unavailable(
            handshake.error.unwrap_or_else(|| "detector reported not ready".into()),
        ));
    }
    if handshake.dimension == 0 {
        return Err(DetectorError::InvalidOutput("handshake: dimension must be positive".into()));
    }
    Ok(handshake.dimension)
}

fn parse_response(
    line: &str,
    dimension: usize,
    width: u32,
    height: u32,
) -> Result<Vec<DetectedFace>, DetectorError> {
    let response: Response = serde_json::from_str(line)
        .map_err(|e| DetectorError::InvalidOutput(format!("response: {e}")))?;
    let faces = match response {
        Response::Faces { faces } => faces,
        Response::Error { error } => return Err(DetectorError::Failed(error)),
    };

    faces
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let descriptor = Descriptor::new(raw.descriptor)
                .map_err(|e| DetectorError::InvalidOutput(format!("face {i}: {e}")))?;
            if descriptor.len() != dimension {
                return Err(DetectorError::InvalidOutput(format!(
                    "face {i}: descriptor has {} values, expected {dimension}",
                    descriptor.len()
                )));
            }
            let b = raw.bbox;
            let bbox = FaceBox::from_pixels(b.x, b.y, b.width, b.height, width, height);
            if !bbox.is_normalized() {
                return Err(DetectorError::InvalidOutput(format!(
                    "face {i}: box ({}, {}, {}x{}) outside {width}x{height} frame",
                    b.x, b.y, b.width, b.height
                )));
            }
            Ok(DetectedFace { bbox, descriptor })
        })
        .collect()
}

/// A running detector process.
pub struct ProcessDetector {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    dimension: usize,
    line: String,
}

impl ProcessDetector {
    /// Start the detector and wait for its handshake.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, DetectorError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| DetectorError::Unavailable(format!("{program}: {e}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(DetectorError::Unavailable(format!("{program}: stdio not captured")));
        };

        let mut detector = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            dimension: 0,
            line: String::new(),
        };
        let handshake = detector.read_line()?;
        detector.dimension = parse_handshake(&handshake)?;

        tracing::info!(
            program,
            pid = detector.child.id(),
            dimension = detector.dimension,
            "detector process ready"
        );
        Ok(detector)
    }

    fn read_line(&mut self) -> Result<String, DetectorError> {
        self.line.clear();
        let n = self.stdout.read_line(&mut self.line)?;
        if n == 0 {
            return Err(DetectorError::Unavailable("detector process exited".into()));
        }
        Ok(self.line.trim_end().to_string())
    }

    fn send_frame(&mut self, frame: &[u8], width: u32, height: u32) -> std::io::Result<()> {
        let header = serde_json::json!({ "width": width, "height": height, "format": "gray8" });
        writeln!(self.stdin, "{header}")?;
        self.stdin.write_all(frame)?;
        self.stdin.flush()
    }
}

impl Detector for ProcessDetector {
    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, DetectorError> {
        let expected = (width as usize) * (height as usize);
        if frame.len() != expected {
            return Err(DetectorError::Failed(format!(
                "frame has {} bytes, expected {expected}",
                frame.len()
            )));
        }

        self.send_frame(frame, width, height).map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                DetectorError::Unavailable("detector process exited".into())
            } else {
                DetectorError::Io(e)
            }
        })?;

        let line = self.read_line()?;
        parse_response(&line, self.dimension, width, height)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

impl Drop for ProcessDetector {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake() {
        assert_eq!(parse_handshake(r#"{"ready":true,"dimension":128}"#).unwrap(), 128);
        assert!(matches!(
            parse_handshake(r#"{"ready":false,"error":"model missing"}"#),
            Err(DetectorError::Unavailable(msg)) if msg == "model missing"
        ));
        assert!(matches!(
            parse_handshake(r#"{"ready":true,"dimension":0}"#),
            Err(DetectorError::InvalidOutput(_))
        ));
        assert!(matches!(parse_handshake("hello"), Err(DetectorError::InvalidOutput(_))));
    }

    #[test]
    fn test_response_normalizes_pixel_boxes() {
        let line = r#"{"faces":[{"box":{"x":64,"y":48,"width":160,"height":120},"descriptor":[0.1,0.2,0.3]}]}"#;
        let faces = parse_response(line, 3, 640, 480).unwrap();
        assert_eq!(faces.len(), 1);
        let b = faces[0].bbox;
        assert!((b.x - 0.1).abs() < 1e-6);
        assert!((b.y - 0.1).abs() < 1e-6);
        assert!((b.width - 0.25).abs() < 1e-6);
        assert!((b.height - 0.25).abs() < 1e-6);
        assert_eq!(faces[0].descriptor.values(), &[0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_response_no_faces() {
        assert!(parse_response(r#"{"faces":[]}"#, 128, 640, 480).unwrap().is_empty());
    }

    #[test]
    fn test_response_error_line() {
        let err = parse_response(r#"{"error":"inference failed"}"#, 3, 640, 480).unwrap_err();
        assert!(matches!(err, DetectorError::Failed(msg) if msg == "inference failed"));
    }

    #[test]
    fn test_response_rejects_wrong_dimension() {
        let line = r#"{"faces":[{"box":{"x":0,"y":0,"width":10,"height":10},"descriptor":[0.1,0.2]}]}"#;
        assert!(matches!(
            parse_response(line, 3, 640, 480),
            Err(DetectorError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_response_rejects_box_outside_frame() {
        let line = r#"{"faces":[{"box":{"x":600,"y":0,"width":100,"height":10},"descriptor":[0.1]}]}"#;
        assert!(matches!(
            parse_response(line, 1, 640, 480),
            Err(DetectorError::InvalidOutput(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("detector.sh");
        std::fs::write(
            &script,
            r#"echo '{"ready":true,"dimension":2}'
while read -r header; do
  head -c 4 > /dev/null
  echo '{"faces":[{"box":{"x":0,"y":0,"width":1,"height":2},"descriptor":[0.5,0.25]}]}'
done
"#,
        )
        .unwrap();

        let mut detector =
            ProcessDetector::spawn("sh", &[script.to_string_lossy().into_owned()]).unwrap();
        assert_eq!(detector.dimension(), 2);

        for _ in 0..2 {
            let faces = detector.detect(&[10, 20, 30, 40], 2, 2).unwrap();
            assert_eq!(faces.len(), 1);
            assert_eq!(faces[0].bbox, FaceBox { x: 0.0, y: 0.0, width: 0.5, height: 1.0 });
            assert_eq!(faces[0].descriptor.values(), &[0.5, 0.25]);
        }

        assert!(matches!(
            detector.detect(&[0, 0, 0], 2, 2),
            Err(DetectorError::Failed(_))
        ));
    }

    #[test]
    fn test_missing_program() {
        assert!(matches!(
            ProcessDetector::spawn("/nonexistent/tatami-detector", &[]),
            Err(DetectorError::Unavailable(_))
        ));
    }
}
