//! A real `ConnectionSession` driving `IrcTransportFactory` against a
//! scripted IRC server on a loopback socket.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use palaver_core::roster::UserMode;
use palaver_core::{ConnectionSession, ConnectionState, MessageKind, ServerConfig, SessionOptions};
use palaver_irc::IrcTransportFactory;

const WAIT: Duration = Duration::from_secs(5);

struct FakeServer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakeServer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> Self {
        let (r, w) = stream.into_split();
        Self { reader: BufReader::new(r), writer: w }
    }

    async fn line(&mut self) -> Option<String> {
        let mut buf = String::new();
        let n = tokio::time::timeout(WAIT, self.reader.read_line(&mut buf)).await.unwrap().unwrap();
        (n > 0).then(|| buf.trim_end().to_string())
    }

    /// Read until a line starting with `prefix`, returning it.
    async fn expect(&mut self, prefix: &str) -> String {
        loop {
            match self.line().await {
                Some(line) if line.starts_with(prefix) => return line,
                Some(_) => continue,
                None => panic!("connection closed while waiting for {prefix:?}"),
            }
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
    }

    async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Walk the client through CAP negotiation and the welcome burst.
    async fn register(&mut self, nick: &str) {
        assert_eq!(self.line().await.as_deref(), Some("CAP LS 302"));
        assert_eq!(self.line().await, Some(format!("NICK {nick}")));
        assert!(self.line().await.unwrap().starts_with("USER "));
        self.send(":irc.test CAP * LS :multi-prefix server-time").await;
        assert_eq!(self.line().await.as_deref(), Some("CAP REQ multi-prefix"));
        self.send(":irc.test CAP * ACK :multi-prefix").await;
        assert_eq!(self.line().await.as_deref(), Some("CAP END"));
        self.send(&format!(":irc.test 001 {nick} :Welcome to the test network")).await;
        self.send(&format!(":irc.test 005 {nick} PREFIX=(ov)@+ CHANMODES=b,k,l,imnt :are supported")).await;
    }
}

async fn setup(auto_join: &str) -> (TcpListener, ConnectionSession) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        server_name: "testnet".into(),
        hostname: "127.0.0.1".into(),
        port,
        nickname: "alice".into(),
        auto_join_channels: auto_join.into(),
        ..Default::default()
    };
    let session = ConnectionSession::new(config, Arc::new(IrcTransportFactory::new()), SessionOptions::default());
    (listener, session)
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn registers_and_auto_joins() {
    let (listener, session) = setup("rust").await;
    session.connect().await.unwrap();
    let s = &session;
    let mut server = FakeServer::accept(&listener).await;
    server.register("alice").await;

    server.expect("JOIN #rust").await;
    server.send(":alice!a@host JOIN #rust").await;
    server.send(":irc.test 332 alice #rust :All things Rust").await;
    server.send(":irc.test 353 alice = #rust :alice @bob +carol").await;
    server.send(":irc.test 366 alice #rust :End of /NAMES list.").await;

    wait_until(|| async move { s.channel("#rust").await.unwrap().is_some_and(|c| c.users.len() == 3) }).await;
    let channel = session.channel("#rust").await.unwrap().unwrap();
    assert_eq!(channel.topic.as_deref(), Some("All things Rust"));
    assert!(channel.users["bob"].modes.contains(&UserMode::Op));
    assert!(channel.users["carol"].modes.contains(&UserMode::Voice));
    assert!(matches!(session.state(), ConnectionState::Connected { .. }));
}

#[tokio::test]
async fn mode_change_resyncs_roster() {
    let (listener, session) = setup("rust").await;
    session.connect().await.unwrap();
    let s = &session;
    let mut server = FakeServer::accept(&listener).await;
    server.register("alice").await;
    server.expect("JOIN #rust").await;
    server.send(":alice!a@host JOIN #rust").await;
    server.send(":irc.test 353 alice = #rust :alice bob").await;
    server.send(":irc.test 366 alice #rust :End").await;
    server.send(":alice!a@host MODE #rust +v bob").await;

    wait_until(|| async move {
        s
            .channel("#rust")
            .await
            .unwrap()
            .and_then(|c| c.users.get("bob").cloned())
            .is_some_and(|u| u.modes.contains(&UserMode::Voice))
    })
    .await;
}

#[tokio::test]
async fn messages_reach_the_bus_and_pings_are_answered() {
    let (listener, session) = setup("").await;
    let mut bus = session.subscribe();
    session.connect().await.unwrap();
    let mut server = FakeServer::accept(&listener).await;
    server.register("alice").await;

    server.send("PING :irc.test").await;
    assert_eq!(server.expect("PONG").await, "PONG irc.test");

    server.send(":bob!b@host PRIVMSG alice :hello there").await;
    let msg = tokio::time::timeout(WAIT, async {
        loop {
            let m = bus.recv().await.unwrap();
            if m.kind == MessageKind::Normal && m.sender == "bob" {
                return m;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(msg.target, "bob");
    assert_eq!(msg.content, "hello there");

    session.send_message("bob", "hi\nsecond line").await.unwrap();
    assert_eq!(server.expect("PRIVMSG").await, "PRIVMSG bob hi");
    assert_eq!(server.expect("PRIVMSG").await, "PRIVMSG bob :second line");
}

#[tokio::test]
async fn non_utf8_line_keeps_the_connection() {
    let (listener, session) = setup("").await;
    let mut bus = session.subscribe();
    session.connect().await.unwrap();
    let mut server = FakeServer::accept(&listener).await;
    server.register("alice").await;

    server.send_bytes(b":bob!b@host PRIVMSG alice :caf\xe9 latin1\r\n").await;
    server.send(":bob!b@host PRIVMSG alice :still here").await;
    let contents = tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            let m = bus.recv().await.unwrap();
            if m.kind == MessageKind::Normal && m.sender == "bob" {
                seen.push(m.content);
                if seen.len() == 2 {
                    return seen;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(contents, ["caf\u{fffd} latin1", "still here"]);
    assert!(session.state().is_connected());
}

#[tokio::test]
async fn nick_collision_falls_back() {
    let (listener, session) = setup("").await;
    session.connect().await.unwrap();
    let s = &session;
    let mut server = FakeServer::accept(&listener).await;
    server.expect("USER").await;
    server.send(":irc.test 433 * alice :Nickname is already in use").await;
    assert_eq!(server.expect("NICK").await, "NICK alice1");
    server.send(":irc.test 001 alice1 :Welcome").await;

    wait_until(|| async move { s.current_nickname() == "alice1" }).await;
}

#[tokio::test]
async fn disconnect_sends_quit() {
    let (listener, session) = setup("").await;
    session.connect().await.unwrap();
    let s = &session;
    let mut server = FakeServer::accept(&listener).await;
    server.register("alice").await;
    wait_until(|| async move { s.current_nickname() == "alice" && s.state().is_connected() }).await;

    session.disconnect("see you").await.unwrap();
    assert_eq!(server.expect("QUIT").await, "QUIT :see you");
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn server_close_ends_connection() {
    let (listener, session) = setup("").await;
    let mut states = session.watch_state();
    session.connect().await.unwrap();
    let mut server = FakeServer::accept(&listener).await;
    server.register("alice").await;
    states.wait_for(|s| s.is_connected()).await.unwrap();

    server.send("ERROR :Closing Link: 127.0.0.1 (K-Lined)").await;
    drop(server);
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Disconnected))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn refused_connection_is_an_error_state() {
    let (listener, session) = setup("").await;
    drop(listener);
    let mut states = session.watch_state();
    session.connect().await.unwrap();
    tokio::time::timeout(WAIT, states.wait_for(|s| matches!(s, ConnectionState::Error { .. })))
        .await
        .unwrap()
        .unwrap();
}
