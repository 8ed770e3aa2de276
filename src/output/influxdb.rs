//! InfluxDB backend: line protocol rendering and the HTTP write endpoint.

use super::{Backend, BackendError};
use crate::config::BackendConfig;
use crate::measurement::{Measurement, Tags};
use log::debug;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;

/// Name of the single field every point carries.
pub const VALUE_FIELD: &str = "value";

/// Data point in InfluxDB line protocol, millisecond precision.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: Tags,
    pub value: f64,
    pub timestamp: SystemTime,
}

impl From<&Measurement> for DataPoint {
    fn from(m: &Measurement) -> Self {
        DataPoint {
            measurement: m.name.to_string(),
            tag_set: m.tags.clone(),
            value: m.value,
            timestamp: m.timestamp,
        }
    }
}

fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if special.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn fmt_tags(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (key, value) in data_point.tag_set.iter() {
        write!(
            fmt,
            ",{}={}",
            escape(key, &[',', '=', ' ']),
            escape(value, &[',', '=', ' '])
        )?;
    }
    Ok(())
}

fn fmt_timestamp(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    let millis = data_point
        .timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    write!(fmt, " {millis}")
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", escape(&self.measurement, &[',', ' ']))?;
        fmt_tags(self, fmt)?;
        write!(fmt, " {VALUE_FIELD}={}", self.value)?;
        fmt_timestamp(self, fmt)
    }
}

/// Render a batch as a line protocol request body.
pub fn to_line_protocol(points: &[DataPoint]) -> String {
    points
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Writes batches to an InfluxDB 1.x compatible `/write` endpoint.
pub struct InfluxDbBackend {
    client: reqwest::Client,
    url: String,
    database: String,
    user: String,
    password: String,
}

impl InfluxDbBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/write", config.host.trim_end_matches('/')),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, body: String) -> Result<(), BackendError> {
        let response = self
            .client
            .post(&self.url)
            .query(&[("db", self.database.as_str()), ("precision", "ms")])
            .basic_auth(&self.user, Some(&self.password))
            .body(body)
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

impl Backend for InfluxDbBackend {
    fn write<'a>(
        &'a self,
        points: &'a [DataPoint],
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        Box::pin(async move {
            debug!("Writing {} points to {}", points.len(), self.url);
            self.post(to_line_protocol(points)).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn point(measurement: &str, value: f64) -> DataPoint {
        let mut tags = Tags::new();
        tags.insert("sensor".to_string(), "AA:BB:CC:DD:EE:FF".to_string());
        tags.insert("profile".to_string(), "UNKNOWN".to_string());
        DataPoint {
            measurement: measurement.to_string(),
            tag_set: tags,
            value,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_millis(1_709_294_400_000),
        }
    }

    fn backend_config(host: String) -> BackendConfig {
        BackendConfig {
            host,
            database: "scale".to_string(),
            user: "user".to_string(),
            password: "pass".to_string(),
        }
    }

    #[test]
    fn test_data_point_format() {
        assert_eq!(
            point("weight", 72.5).to_string(),
            "weight,profile=UNKNOWN,sensor=AA:BB:CC:DD:EE:FF value=72.5 1709294400000"
        );
    }

    #[test]
    fn test_data_point_escapes_special_characters() {
        let mut p = point("body fat", 21.0);
        p.tag_set.insert("name".to_string(), "a=b, c".to_string());
        let line = p.to_string();
        assert!(line.starts_with("body\\ fat,"));
        assert!(line.contains(",name=a\\=b\\,\\ c,"));
        assert!(line.contains(" value=21 "));
    }

    #[test]
    fn test_from_measurement() {
        let mut tags = Tags::new();
        tags.insert("sensor".to_string(), "AA:BB:CC:DD:EE:FF".to_string());
        let timestamp = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let m = Measurement::new("bone", timestamp, 3.2, tags.clone());

        let p = DataPoint::from(&m);
        assert_eq!(p.measurement, "bone");
        assert_eq!(p.tag_set, tags);
        assert_eq!(p.value, 3.2);
        assert_eq!(p.timestamp, timestamp);
    }

    #[test]
    fn test_line_protocol_joins_lines() {
        let body = to_line_protocol(&[point("weight", 70.0), point("fat", 20.5)]);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("weight,"));
        assert!(lines[1].starts_with("fat,"));
    }

    #[test]
    fn test_url_strips_trailing_slash() {
        let backend = InfluxDbBackend::new(&backend_config("http://localhost:8086/".to_string()));
        assert_eq!(backend.url(), "http://localhost:8086/write");
    }

    /// Accept one request, answer with `status_line`, and return the raw request.
    async fn serve_once(listener: TcpListener, status_line: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if request.len() >= header_end + 4 + content_length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        let response = format!("{status_line}\r\ncontent-length: 5\r\nconnection: close\r\n\r\noops!");
        socket.write_all(response.as_bytes()).await.unwrap();
        String::from_utf8(request).unwrap()
    }

    #[tokio::test]
    async fn test_backend_posts_line_protocol() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_once(listener, "HTTP/1.1 200 OK"));

        let backend = InfluxDbBackend::new(&backend_config(host));
        let points = vec![point("weight", 72.5)];
        backend.write(&points).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /write?db=scale&precision=ms HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: basic dxnlcjpwyxnz"));
        assert!(request.ends_with("weight,profile=UNKNOWN,sensor=AA:BB:CC:DD:EE:FF value=72.5 1709294400000"));
    }

    #[tokio::test]
    async fn test_backend_reports_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_once(listener, "HTTP/1.1 500 Internal Server Error"));

        let backend = InfluxDbBackend::new(&backend_config(host));
        let points = vec![point("weight", 72.5)];
        let err = backend.write(&points).await.unwrap_err();
        server.await.unwrap();

        assert_eq!(
            err,
            BackendError::Rejected {
                status: 500,
                body: "oops!".to_string()
            }
        );
    }

    #[test]
    fn test_backend_reports_connection_failure() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let backend = InfluxDbBackend::new(&backend_config(format!("http://{addr}")));
        let points = vec![point("weight", 72.5)];
        let result = tokio_test::block_on(backend.write(&points));
        assert!(matches!(result, Err(BackendError::Http(_))));
    }
}
