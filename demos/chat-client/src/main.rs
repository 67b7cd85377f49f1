//! Minimal interactive terminal client for the chatroom server.
//!
//! Convenience wrapper for exercising the server by hand: connects, performs
//! the name handshake, then runs a reader thread alongside a stdin REPL.
//! Carries no testable properties beyond "it doesn't crash" — the protocol
//! logic it exercises is covered by `chat-net`'s own test suite.

use std::{
    io::{self, BufRead, Read, Write},
    net::TcpStream,
    process::ExitCode,
    thread,
};

use chat_net::{decode_string, decode_u32, encode_string, encode_u32};

const CHAT_PACKET_ID: u32 = 0;
const COMMAND_PACKET_ID: u32 = 1;

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args.next().unwrap_or_else(|| "7878".to_string());

    let Ok(mut stream) = TcpStream::connect((host.as_str(), port.parse().unwrap_or(7878))) else {
        eprintln!("could not connect to {host}:{port}");
        return ExitCode::FAILURE;
    };

    print!("display name: ");
    io::stdout().flush().ok();
    let mut name = String::new();
    if io::stdin().lock().read_line(&mut name).is_err() {
        return ExitCode::FAILURE;
    }
    let name = name.trim();

    let mut handshake = Vec::new();
    encode_string(&mut handshake, name);
    if stream.write_all(&handshake).is_err() {
        eprintln!("handshake write failed");
        return ExitCode::FAILURE;
    }

    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            eprintln!("could not clone socket: {err}");
            return ExitCode::FAILURE;
        }
    };
    thread::spawn(move || read_loop(reader_stream));

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let packet = encode_outgoing(&line);
        let mut frame = Vec::new();
        encode_u32(&mut frame, packet.len() as u32);
        frame.extend_from_slice(&packet);
        if stream.write_all(&frame).is_err() {
            break;
        }
    }

    ExitCode::SUCCESS
}

/// Strips a leading `/` into the command packet id; a literal leading `//`
/// collapses to one `/` of chat text, per the client-side convention the
/// wire protocol assumes.
fn encode_outgoing(line: &str) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(rest) = line.strip_prefix('/') {
        if let Some(escaped) = rest.strip_prefix('/') {
            encode_u32(&mut out, CHAT_PACKET_ID);
            encode_string(&mut out, &format!("/{escaped}"));
        } else {
            encode_u32(&mut out, COMMAND_PACKET_ID);
            encode_string(&mut out, rest);
        }
    } else {
        encode_u32(&mut out, CHAT_PACKET_ID);
        encode_string(&mut out, line);
    }
    out
}

/// Server packets are not wrapped in an outer length frame: read the 4-byte
/// id, then a length-prefixed string, directly off the stream.
fn read_loop(mut stream: TcpStream) {
    let mut header = [0u8; 8];
    loop {
        if stream.read_exact(&mut header[..4]).is_err() {
            println!("disconnected from server");
            return;
        }
        let (_id, _) = match decode_u32(&header, 0) {
            Ok(v) => v,
            Err(_) => return,
        };

        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).is_err() {
            return;
        }
        let (len, _) = match decode_u32(&len_buf, 0) {
            Ok(v) => v,
            Err(_) => return,
        };

        let mut payload = vec![0u8; len as usize];
        if stream.read_exact(&mut payload).is_err() {
            return;
        }

        let mut full = Vec::with_capacity(4 + payload.len());
        full.extend_from_slice(&len_buf);
        full.extend_from_slice(&payload);
        match decode_string(&full, 0) {
            Ok((s, _)) => println!("{s}"),
            Err(_) => println!("<malformed server message>"),
        }
    }
}
