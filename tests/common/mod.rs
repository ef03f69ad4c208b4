#![allow(dead_code)]

use std::path::Path;

use shopetl::storage::Warehouse;
use tempfile::TempDir;

/// A file-backed SQLite warehouse that lives as long as the returned dir.
pub async fn temp_warehouse() -> (TempDir, Warehouse) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("warehouse.db").display());
    let warehouse = Warehouse::connect(&url, 4).await.unwrap();
    (dir, warehouse)
}

pub async fn count(warehouse: &Warehouse, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(warehouse.pool())
        .await
        .unwrap()
}

pub fn write_file(dir: &Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).unwrap();
}

/// Read one HTTP request: headers plus a `Content-Length` body.
fn read_request(stream: &mut std::net::TcpStream) -> String {
    use std::io::Read;

    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).unwrap_or(0);
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&data);
        if let Some(end) = text.find("\r\n\r\n") {
            let content_length = text[..end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).to_string()
}

/// Spawn a mock HTTP server that answers one connection per canned
/// `(status, body)` response, in order, and captures each raw request.
pub fn spawn_mock_server(
    responses: Vec<(u16, String)>,
) -> (
    String,
    std::thread::JoinHandle<()>,
    std::sync::mpsc::Receiver<String>,
) {
    use std::io::Write;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{}", addr);
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = std::thread::spawn(move || {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let captured = read_request(&mut stream);
            let _ = tx.send(captured);
            let response = format!(
                "HTTP/1.1 {} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }
    });
    (url, handle, rx)
}
