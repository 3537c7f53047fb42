//! Trivial TCP echo pair used as a demonstration target for the preload
//! shim. Deliberately blocking, one thread per connection: exactly the shape
//! the shim's thread-context propagation exists for.

use std::io::{Read, Write};
use std::mem::MaybeUninit;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd};
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "socktrace-echo", about = "TCP echo pair for exercising the preload shim")]
struct Args {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run the echo server, one thread per connection.
	Serve {
		#[arg(long, default_value = "127.0.0.1:5000")]
		addr: SocketAddr,
	},
	/// Send a message and print the echo.
	Call {
		#[arg(long, default_value = "127.0.0.1:5000")]
		addr: SocketAddr,
		#[arg(long, default_value = "hello over interposed sockets")]
		message: String,
		#[arg(long, default_value_t = 1)]
		count: u32,
	},
}

fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
		)
		.init();
	match Args::parse().command {
		Command::Serve { addr } => serve(addr),
		Command::Call {
			addr,
			message,
			count,
		} => call(addr, &message, count),
	}
}

fn serve(addr: SocketAddr) -> Result<()> {
	let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
	info!(%addr, "echo server listening");
	loop {
		// std's accept goes through accept4, which the shim does not
		// interpose; take the connection with plain accept so a preloaded
		// run sees it
		let fd = unsafe {
			libc::accept(
				listener.as_raw_fd(),
				std::ptr::null_mut(),
				std::ptr::null_mut(),
			)
		};
		if fd < 0 {
			let err = std::io::Error::last_os_error();
			error!(%err, "accept failed");
			continue;
		}
		let stream = unsafe { TcpStream::from_raw_fd(fd) };
		thread::spawn(move || {
			if let Err(err) = echo_one(stream) {
				error!(%err, "connection failed");
			}
		});
	}
}

fn echo_one(mut stream: TcpStream) -> Result<()> {
	let peer = stream.peer_addr().ok();
	let mut buf = [0u8; 4096];
	loop {
		let n = stream.read(&mut buf)?;
		if n == 0 {
			info!(?peer, "peer closed");
			return Ok(());
		}
		stream.write_all(&buf[..n])?;
	}
}

fn call(addr: SocketAddr, message: &str, count: u32) -> Result<()> {
	let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
	let socket = Socket::new(domain, Type::STREAM, None).context("socket")?;
	socket
		.connect(&SockAddr::from(addr))
		.with_context(|| format!("connect {addr}"))?;
	for round in 0..count {
		socket.send(message.as_bytes()).context("send")?;
		let mut buf = vec![MaybeUninit::<u8>::uninit(); message.len().max(1)];
		let n = socket.recv(&mut buf).context("recv")?;
		let reply: Vec<u8> = buf[..n].iter().map(|byte| unsafe { byte.assume_init() }).collect();
		info!(round, reply = %String::from_utf8_lossy(&reply), "echo received");
	}
	Ok(())
}
