use std::net::SocketAddr;
use std::str::FromStr;

use asyncoro::fiber::Fiber;
use asyncoro::net::{AsyncTcpListener, AsyncTcpStream};
use asyncoro::{Config, Coro, Result, Value};

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5555";

fn listen_addr() -> SocketAddr {
    SocketAddr::from_str(DEFAULT_LISTEN_ADDR).unwrap()
}

fn serve_one(coro: &mut Coro<'_>, mut conn: AsyncTcpStream) -> Result<()> {
    loop {
        let buf = conn.recv(coro, 16 * 1024, None)?;
        if buf.is_empty() {
            break; // peer closed the connection
        }
        conn.sendall(coro, &buf, None)?;
    }
    Ok(())
}

fn main() {
    env_logger::init();

    asyncoro::start(Config::new(), |mut coro| {
        let addr = listen_addr();
        let mut listener = AsyncTcpListener::bind(coro.handle(), addr)?;
        println!("Starting tcp echo server on {}", listener.local_addr()?);

        loop {
            let (conn, peer) = listener.accept(&mut coro, None)?;
            println!("accepted connection from {}", peer);
            coro.handle().spawn("echo-conn", Fiber::DEFAULT_STACK_SIZE, move |mut c| {
                if let Err(e) = serve_one(&mut c, conn) {
                    eprintln!("connection error: {}", e);
                }
                Ok(Value::None)
            });
        }
    });
}
