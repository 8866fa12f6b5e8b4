use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// A server that answers every command with a canned reply and keeps counts
/// for the assertions.
pub struct MockServer {
    pub addr: SocketAddr,
    pub commands: Arc<AtomicUsize>,
    pub connections: Arc<AtomicUsize>,
    pub bytes_read: Arc<AtomicUsize>,
    pub first_command: Arc<Mutex<Option<String>>>,
}

pub async fn spawn_ok_server() -> MockServer {
    spawn_server(b"+OK\r\n").await
}

pub async fn spawn_server(reply: &'static [u8]) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let commands = Arc::new(AtomicUsize::new(0));
    let connections = Arc::new(AtomicUsize::new(0));
    let bytes_read = Arc::new(AtomicUsize::new(0));
    let first_command = Arc::new(Mutex::new(None));

    let server = MockServer {
        addr,
        commands: Arc::clone(&commands),
        connections: Arc::clone(&connections),
        bytes_read: Arc::clone(&bytes_read),
        first_command: Arc::clone(&first_command),
    };

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(
                stream,
                reply,
                Arc::clone(&commands),
                Arc::clone(&bytes_read),
                Arc::clone(&first_command),
            ));
        }
    });

    server
}

async fn serve(
    mut stream: TcpStream,
    reply: &'static [u8],
    commands: Arc<AtomicUsize>,
    bytes_read: Arc<AtomicUsize>,
    first_command: Arc<Mutex<Option<String>>>,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        bytes_read.fetch_add(n, Ordering::SeqCst);
        buf.extend_from_slice(&chunk[..n]);

        while let Some((name, used)) = take_command(&buf) {
            buf.drain(..used);
            commands.fetch_add(1, Ordering::SeqCst);
            first_command.lock().unwrap().get_or_insert(name);
            if stream.write_all(reply).await.is_err() {
                return;
            }
        }
    }
}

/// Pop one complete request off the front of `buf`: either a multi-bulk
/// array or an inline command line. Returns the command name and frame size.
fn take_command(buf: &[u8]) -> Option<(String, usize)> {
    fn line(buf: &[u8]) -> Option<(&[u8], usize)> {
        let end = buf.windows(2).position(|w| w == b"\r\n")?;
        Some((&buf[..end], end + 2))
    }

    if *buf.first()? == b'*' {
        let (header, mut used) = line(buf)?;
        let argc: usize = std::str::from_utf8(&header[1..]).ok()?.parse().ok()?;
        let mut name = String::new();
        for i in 0..argc {
            let (header, n) = line(&buf[used..])?;
            assert_eq!(header.first(), Some(&b'$'), "expected a bulk argument");
            let len: usize = std::str::from_utf8(&header[1..]).ok()?.parse().ok()?;
            used += n;
            if buf.len() < used + len + 2 {
                return None;
            }
            if i == 0 {
                name = String::from_utf8_lossy(&buf[used..used + len]).into_owned();
            }
            used += len + 2;
        }
        Some((name, used))
    } else {
        let (text, used) = line(buf)?;
        Some((String::from_utf8_lossy(text).into_owned(), used))
    }
}
