//! Blocking client and interactive shell.
//!
//! `Client` speaks the binary framing over a plain `TcpStream`; `repl`
//! wraps it in a line-oriented prompt that validates commands locally
//! before anything is sent.

use crate::protocol::{decode_response_header, encode_command, Status, RESPONSE_HEADER_SIZE};
use bytes::Bytes;
use std::io::{self, BufRead, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

/// A decoded server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub payload: Bytes,
}

/// Blocking connection to a server.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Send one command and wait for its response.
    pub fn request<F: AsRef<[u8]>>(&mut self, fields: &[F]) -> io::Result<Response> {
        self.send_raw(&encode_command(fields))?;
        self.read_response()
    }

    /// Write bytes as-is, framed or not.
    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    /// Read exactly one response frame.
    pub fn read_response(&mut self) -> io::Result<Response> {
        let mut header = [0u8; RESPONSE_HEADER_SIZE];
        self.stream.read_exact(&mut header)?;

        let (payload_len, status) = decode_response_header(&header).map_err(|code| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown response status {code}"),
            )
        })?;

        let mut payload = vec![0u8; payload_len];
        self.stream.read_exact(&mut payload)?;

        Ok(Response {
            status,
            payload: Bytes::from(payload),
        })
    }

    #[cfg(test)]
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// One line of user input, classified.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Empty,
    Close,
    Command(Vec<String>),
    Invalid,
}

/// Split a line on whitespace and check the command's arity.
pub fn parse_input(line: &str) -> Input {
    let args: Vec<String> = line.split_whitespace().map(str::to_string).collect();

    let Some(name) = args.first() else {
        return Input::Empty;
    };

    let valid = match name.as_str() {
        "close" => return Input::Close,
        "get" | "del" => args.len() == 2,
        "set" => args.len() == 3,
        _ => false,
    };

    if valid {
        Input::Command(args)
    } else {
        Input::Invalid
    }
}

/// Format a response the way the shell prints it.
fn render(response: &Response) -> String {
    let mut out = match response.status {
        Status::Ok => "Command successfully processed".to_string(),
        Status::Invalid => "Key not found".to_string(),
    };
    if !response.payload.is_empty() {
        out.push_str("\nServer response: ");
        out.push_str(&String::from_utf8_lossy(&response.payload));
    }
    out
}

/// Interactive prompt reading commands from stdin until `close` or EOF.
pub fn repl(addr: &str) -> io::Result<()> {
    let mut client = Client::connect(addr)?;
    info!(addr, "Connected");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = String::new();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        match parse_input(&line) {
            Input::Empty => continue,
            Input::Invalid => writeln!(stdout, "Invalid input")?,
            Input::Close => {
                writeln!(stdout, "User requested close")?;
                break;
            }
            Input::Command(args) => match client.request(&args) {
                Ok(response) => writeln!(stdout, "{}", render(&response))?,
                Err(e) => {
                    debug!(error = %e, "Request failed");
                    eprintln!("Error talking to server: {e}");
                    return Err(e);
                }
            },
        }
    }

    info!("Closed client connection");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(words: &[&str]) -> Input {
        Input::Command(words.iter().map(|w| w.to_string()).collect())
    }

    #[test]
    fn test_parse_input_commands() {
        assert_eq!(parse_input("get k"), args(&["get", "k"]));
        assert_eq!(parse_input("  set  k   v \n"), args(&["set", "k", "v"]));
        assert_eq!(parse_input("del k"), args(&["del", "k"]));
    }

    #[test]
    fn test_parse_input_empty_and_close() {
        assert_eq!(parse_input(""), Input::Empty);
        assert_eq!(parse_input("   \t\n"), Input::Empty);
        assert_eq!(parse_input("close"), Input::Close);
        assert_eq!(parse_input("close now"), Input::Close);
    }

    #[test]
    fn test_parse_input_rejects_bad_arity() {
        assert_eq!(parse_input("get"), Input::Invalid);
        assert_eq!(parse_input("get a b"), Input::Invalid);
        assert_eq!(parse_input("set k"), Input::Invalid);
        assert_eq!(parse_input("del"), Input::Invalid);
        assert_eq!(parse_input("incr k"), Input::Invalid);
        assert_eq!(parse_input("GET k"), Input::Invalid);
    }

    #[test]
    fn test_render() {
        let ok = Response {
            status: Status::Ok,
            payload: Bytes::from_static(b"v"),
        };
        assert_eq!(render(&ok), "Command successfully processed\nServer response: v");

        let missing = Response {
            status: Status::Invalid,
            payload: Bytes::new(),
        };
        assert_eq!(render(&missing), "Key not found");
    }
}
