//! RFC 2217 serial port server for local tools.
//!
//! A tool such as `pio device monitor` connects with an
//! `rfc2217://localhost:4000` URL and gets a serial port whose bytes, baud
//! rate and control lines travel through the operator's session. One client
//! is served at a time.

use std::{collections::HashSet, io, net::SocketAddr};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, ToSocketAddrs},
    sync::{
        broadcast::{self, error::RecvError},
        mpsc,
    },
};

/// Listen port used when none is given.
pub const DEFAULT_PORT: u16 = 4000;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const BINARY: u8 = 0;
const SGA: u8 = 3;
const COM_PORT: u8 = 44;

// COM-PORT-OPTION commands. The server answers each with code + 100.
const SIGNATURE: u8 = 0;
const SET_BAUDRATE: u8 = 1;
const SET_DATASIZE: u8 = 2;
const SET_PARITY: u8 = 3;
const SET_STOPSIZE: u8 = 4;
const SET_CONTROL: u8 = 5;
const PURGE_DATA: u8 = 12;
const SERVER_OFFSET: u8 = 100;

// SET-CONTROL values
const FLOW_QUERY: u8 = 0;
const FLOW_NONE: u8 = 1;
const BREAK_QUERY: u8 = 4;
const BREAK_OFF: u8 = 6;
const DTR_QUERY: u8 = 7;
const DTR_ON: u8 = 8;
const DTR_OFF: u8 = 9;
const RTS_QUERY: u8 = 10;
const RTS_ON: u8 = 11;
const RTS_OFF: u8 = 12;

const SIGNATURE_TEXT: &[u8] = b"support-tunnel";

/// Sent to every client on connect.
const GREETING: [u8; 9] = [IAC, WILL, BINARY, IAC, DO, BINARY, IAC, WILL, SGA];

/// What a port client did, for the operator to forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRequest {
    Attached,
    Data(Vec<u8>),
    Baud(u32),
    Signal { dtr: bool, rts: bool },
    Detached,
}

#[derive(Debug, PartialEq, Eq)]
enum Telnet {
    Data(Vec<u8>),
    Negotiate { verb: u8, option: u8 },
    Subnegotiation(Vec<u8>),
}

#[derive(Debug, Default, Clone, Copy)]
enum ParseState {
    #[default]
    Data,
    Iac,
    Verb(u8),
    Sub,
    SubIac,
}

/// Splits a client stream into data and telnet commands. Commands may
/// straddle reads.
#[derive(Debug, Default)]
struct TelnetParser {
    state: ParseState,
    sub: Vec<u8>,
}

fn flush_data(events: &mut Vec<Telnet>, data: &mut Vec<u8>) {
    if !data.is_empty() {
        events.push(Telnet::Data(std::mem::take(data)));
    }
}

impl TelnetParser {
    fn push(&mut self, bytes: &[u8]) -> Vec<Telnet> {
        let mut events = Vec::new();
        let mut data = Vec::new();
        for &b in bytes {
            self.state = match (self.state, b) {
                (ParseState::Data, IAC) => ParseState::Iac,
                (ParseState::Data, _) => {
                    data.push(b);
                    ParseState::Data
                }
                (ParseState::Iac, IAC) => {
                    data.push(IAC);
                    ParseState::Data
                }
                (ParseState::Iac, WILL | WONT | DO | DONT) => ParseState::Verb(b),
                (ParseState::Iac, SB) => {
                    self.sub.clear();
                    ParseState::Sub
                }
                // NOP, GA and the other bare commands
                (ParseState::Iac, _) => ParseState::Data,
                (ParseState::Verb(verb), option) => {
                    flush_data(&mut events, &mut data);
                    events.push(Telnet::Negotiate { verb, option });
                    ParseState::Data
                }
                (ParseState::Sub, IAC) => ParseState::SubIac,
                (ParseState::Sub, _) => {
                    self.sub.push(b);
                    ParseState::Sub
                }
                (ParseState::SubIac, IAC) => {
                    self.sub.push(IAC);
                    ParseState::Sub
                }
                (ParseState::SubIac, SE) => {
                    flush_data(&mut events, &mut data);
                    events.push(Telnet::Subnegotiation(std::mem::take(&mut self.sub)));
                    ParseState::Data
                }
                (ParseState::SubIac, _) => ParseState::Sub,
            };
        }
        flush_data(&mut events, &mut data);
        events
    }
}

fn escape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out
}

fn com_port_reply(code: u8, value: &[u8]) -> Vec<u8> {
    let mut out = vec![IAC, SB, COM_PORT, code];
    out.extend(escape(value));
    out.extend_from_slice(&[IAC, SE]);
    out
}

/// Echo a setting back, or report the fixed 8N1 value for a query.
fn setting(value: &[u8], fixed: u8) -> Vec<u8> {
    match value {
        [0] | [] => vec![fixed],
        other => other.to_vec(),
    }
}

/// Line state and option negotiation for one client.
struct PortClient<'a> {
    requests: &'a mpsc::UnboundedSender<PortRequest>,
    offered: HashSet<u8>,
    accepted: HashSet<u8>,
    refused: HashSet<(u8, u8)>,
    baud: Option<u32>,
    dtr: bool,
    rts: bool,
}

impl<'a> PortClient<'a> {
    fn new(requests: &'a mpsc::UnboundedSender<PortRequest>) -> Self {
        Self {
            requests,
            offered: HashSet::from([BINARY, SGA]),
            accepted: HashSet::from([BINARY]),
            refused: HashSet::new(),
            baud: None,
            dtr: false,
            rts: false,
        }
    }

    fn forward(&self, request: PortRequest) -> io::Result<()> {
        self.requests
            .send(request)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "operator endpoint stopped"))
    }

    fn set_dtr(&mut self, on: bool) -> io::Result<()> {
        if self.dtr == on {
            return Ok(());
        }
        self.dtr = on;
        self.forward(PortRequest::Signal {
            dtr: self.dtr,
            rts: self.rts,
        })
    }

    fn set_rts(&mut self, on: bool) -> io::Result<()> {
        if self.rts == on {
            return Ok(());
        }
        self.rts = on;
        self.forward(PortRequest::Signal {
            dtr: self.dtr,
            rts: self.rts,
        })
    }

    /// Announce the client and raise both lines, RTS first.
    fn attach(&mut self) -> io::Result<()> {
        self.forward(PortRequest::Attached)?;
        self.set_rts(true)?;
        self.set_dtr(true)
    }

    /// Drop both lines, DTR first. The operator may already be gone.
    fn detach(&mut self) {
        let _ = self.set_dtr(false);
        let _ = self.set_rts(false);
        let _ = self.forward(PortRequest::Detached);
    }

    fn negotiate(&mut self, verb: u8, option: u8) -> Option<[u8; 3]> {
        match verb {
            WILL if matches!(option, BINARY | SGA | COM_PORT) => {
                self.accepted.insert(option).then_some([IAC, DO, option])
            }
            DO if matches!(option, BINARY | SGA) => {
                self.offered.insert(option).then_some([IAC, WILL, option])
            }
            WILL => self.refused.insert((verb, option)).then_some([IAC, DONT, option]),
            DO => self.refused.insert((verb, option)).then_some([IAC, WONT, option]),
            _ => None,
        }
    }

    fn subnegotiate(&mut self, payload: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let [COM_PORT, command, value @ ..] = payload else {
            return Ok(None);
        };
        let answer = match *command {
            SIGNATURE => SIGNATURE_TEXT.to_vec(),
            SET_BAUDRATE => {
                let Ok(raw) = <[u8; 4]>::try_from(value) else {
                    return Ok(None);
                };
                let rate = u32::from_be_bytes(raw);
                if rate != 0 && self.baud != Some(rate) {
                    self.baud = Some(rate);
                    self.forward(PortRequest::Baud(rate))?;
                }
                self.baud.unwrap_or(rate).to_be_bytes().to_vec()
            }
            SET_DATASIZE => setting(value, 8),
            SET_PARITY | SET_STOPSIZE => setting(value, 1),
            SET_CONTROL => vec![self.control(value.first().copied().unwrap_or(FLOW_QUERY))?],
            code if code <= PURGE_DATA => value.to_vec(),
            _ => return Ok(None),
        };
        Ok(Some(com_port_reply(command + SERVER_OFFSET, &answer)))
    }

    fn control(&mut self, value: u8) -> io::Result<u8> {
        Ok(match value {
            FLOW_QUERY => FLOW_NONE,
            BREAK_QUERY => BREAK_OFF,
            DTR_QUERY if self.dtr => DTR_ON,
            DTR_QUERY => DTR_OFF,
            RTS_QUERY if self.rts => RTS_ON,
            RTS_QUERY => RTS_OFF,
            DTR_ON | DTR_OFF => {
                self.set_dtr(value == DTR_ON)?;
                value
            }
            RTS_ON | RTS_OFF => {
                self.set_rts(value == RTS_ON)?;
                value
            }
            other => other,
        })
    }

    async fn pump<S>(
        &mut self,
        stream: &mut S,
        output: &mut broadcast::Receiver<Vec<u8>>,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&GREETING).await?;
        let mut parser = TelnetParser::default();
        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                read = stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    let mut reply = Vec::new();
                    for event in parser.push(&buf[..n]) {
                        match event {
                            Telnet::Data(bytes) => self.forward(PortRequest::Data(bytes))?,
                            Telnet::Negotiate { verb, option } => {
                                if let Some(command) = self.negotiate(verb, option) {
                                    reply.extend_from_slice(&command);
                                }
                            }
                            Telnet::Subnegotiation(payload) => {
                                if let Some(answer) = self.subnegotiate(&payload)? {
                                    reply.extend(answer);
                                }
                            }
                        }
                    }
                    if !reply.is_empty() {
                        stream.write_all(&reply).await?;
                    }
                }
                out = output.recv() => match out {
                    Ok(bytes) => stream.write_all(&escape(&bytes)).await?,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Port client fell behind device output");
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }
}

/// Serve one connected client until it hangs up or the operator stops.
///
/// # Errors
/// Returns error if the client connection fails or the operator endpoint
/// stopped taking requests.
pub async fn serve_client<S>(
    mut stream: S,
    requests: &mpsc::UnboundedSender<PortRequest>,
    mut output: broadcast::Receiver<Vec<u8>>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client = PortClient::new(requests);
    client.attach()?;
    let result = client.pump(&mut stream, &mut output).await;
    client.detach();
    result
}

/// Local RFC 2217 listener.
pub struct PortBridge {
    listener: TcpListener,
}

impl PortBridge {
    /// # Errors
    /// Returns error if the address cannot be bound.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// # Errors
    /// Returns error if the socket address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients one after another until the operator side stops
    /// taking requests.
    pub async fn serve(
        self,
        requests: mpsc::UnboundedSender<PortRequest>,
        output: broadcast::Sender<Vec<u8>>,
    ) {
        if let Ok(addr) = self.local_addr() {
            tracing::info!(%addr, "Port bridge listening");
        }
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = requests.closed() => return,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Port bridge accept failed: {e}");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer, "TCP_NODELAY not set: {e}");
            }
            tracing::info!(%peer, "Port client connected");
            match serve_client(stream, &requests, output.subscribe()).await {
                Ok(()) => tracing::info!(%peer, "Port client disconnected"),
                Err(e) => tracing::warn!(%peer, "Port client dropped: {e}"),
            }
        }
    }
}
