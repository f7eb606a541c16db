//! `ssh2`-backed implementation of the session seam.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ssh2::{Channel, CheckResult, HashType, KnownHostFileKind, Session};
use tracing::{debug, info, warn};

use super::host_keys::{
    HostKeyDecision, HostKeyPolicy, KnownHostStatus, check_fingerprint, known_hosts_decision,
    known_hosts_entry,
};
use super::{
    ExecutionResult, RemoteConfig, RemoteConfigError, RemoteSession, SessionConnector, SessionError,
    SessionInterrupt,
};

/// Pause between polls of an idle channel while draining output.
const DRAIN_BACKOFF: Duration = Duration::from_millis(20);

/// Opens authenticated SSH sessions to instances.
#[derive(Clone, Debug)]
pub struct Ssh2Connector {
    user: String,
    port: u16,
    private_key: Option<Utf8PathBuf>,
    connect_timeout: Duration,
    host_keys: HostKeyPolicy,
}

impl Ssh2Connector {
    /// Builds a connector from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteConfigError`] when the configuration is invalid.
    pub fn from_config(config: &RemoteConfig) -> Result<Self, RemoteConfigError> {
        config.validate()?;
        Ok(Self {
            user: config.user.trim().to_owned(),
            port: config.port,
            private_key: config.private_key_path(),
            connect_timeout: config.connect_timeout(),
            host_keys: config.host_key_verification()?,
        })
    }

    fn verify_host(&self, session: &Session, address: IpAddr) -> Result<(), SessionError> {
        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| SessionError::new("server presented no host key"))?;

        let (known_hosts, accept_new) = match &self.host_keys {
            HostKeyPolicy::Insecure => {
                warn!(%address, "host key verification is disabled");
                return Ok(());
            }
            HostKeyPolicy::Fingerprint(expected) => {
                let digest = session
                    .host_key_hash(HashType::Sha256)
                    .ok_or_else(|| SessionError::new("server host key digest unavailable"))?;
                return check_fingerprint(expected, digest).map_err(SessionError::new);
            }
            HostKeyPolicy::AcceptNew { known_hosts } => (known_hosts, true),
            HostKeyPolicy::Strict { known_hosts } => (known_hosts, false),
        };

        let mut store = session.known_hosts().map_err(ssh_error("open known hosts"))?;
        if known_hosts.exists() {
            store
                .read_file(known_hosts.as_std_path(), KnownHostFileKind::OpenSSH)
                .map_err(ssh_error("read known hosts"))?;
        }

        let host = known_hosts_entry(address, self.port);
        let status = match store.check_port(&address.to_string(), self.port, key) {
            CheckResult::Match => KnownHostStatus::Match,
            CheckResult::NotFound => KnownHostStatus::NotFound,
            CheckResult::Mismatch => KnownHostStatus::Mismatch,
            CheckResult::Failure => {
                return Err(SessionError::new(format!(
                    "failed to check {host} against {known_hosts}"
                )));
            }
        };

        match known_hosts_decision(accept_new, status, &host).map_err(SessionError::new)? {
            HostKeyDecision::Trusted => Ok(()),
            HostKeyDecision::Record => {
                store
                    .add(&host, key, "added by gpurun", key_type.into())
                    .map_err(ssh_error("record host key"))?;
                store
                    .write_file(known_hosts.as_std_path(), KnownHostFileKind::OpenSSH)
                    .map_err(ssh_error("write known hosts"))?;
                info!(%host, file = %known_hosts, "recorded new host key");
                Ok(())
            }
        }
    }

    fn authenticate(&self, session: &Session) -> Result<(), SessionError> {
        self.private_key.as_ref().map_or_else(
            || {
                session
                    .userauth_agent(&self.user)
                    .map_err(ssh_error("agent authentication"))
            },
            |key| {
                session
                    .userauth_pubkey_file(&self.user, None, key.as_std_path(), None)
                    .map_err(ssh_error("public key authentication"))
            },
        )?;
        if session.authenticated() {
            Ok(())
        } else {
            Err(SessionError::new(format!(
                "authentication as {} was rejected",
                self.user
            )))
        }
    }
}

impl SessionConnector for Ssh2Connector {
    type Session = Ssh2Session;

    fn connect(&self, address: IpAddr) -> Result<Self::Session, SessionError> {
        let socket = SocketAddr::new(address, self.port);
        debug!(%socket, user = %self.user, "opening ssh session");
        let tcp = TcpStream::connect_timeout(&socket, self.connect_timeout)
            .map_err(|err| SessionError::new(format!("tcp connect to {socket}: {err}")))?;
        let transport = tcp
            .try_clone()
            .map_err(|err| SessionError::new(format!("share tcp stream: {err}")))?;

        let mut session = Session::new().map_err(ssh_error("create session"))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(self.connect_timeout));
        session.handshake().map_err(ssh_error("handshake"))?;
        self.verify_host(&session, address)?;
        self.authenticate(&session)?;
        // Workloads may run for hours; only connection setup is bounded.
        session.set_timeout(0);

        info!(%socket, user = %self.user, "ssh session established");
        Ok(Ssh2Session {
            session,
            channel: None,
            transport,
        })
    }
}

/// Authenticated SSH session owning at most one command channel.
pub struct Ssh2Session {
    session: Session,
    channel: Option<Channel>,
    transport: TcpStream,
}

impl RemoteSession for Ssh2Session {
    fn upload(&mut self, remote_path: &Utf8Path, contents: &[u8]) -> Result<(), SessionError> {
        let sftp = self.session.sftp().map_err(ssh_error("open sftp channel"))?;
        let mut file = sftp
            .create(remote_path.as_std_path())
            .map_err(ssh_error("create remote file"))?;
        file.write_all(contents)
            .map_err(|err| SessionError::new(format!("write {remote_path}: {err}")))?;
        file.close().map_err(ssh_error("close remote file"))?;
        debug!(%remote_path, bytes = contents.len(), "uploaded workload");
        Ok(())
    }

    fn start(&mut self, command: &str) -> Result<(), SessionError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(ssh_error("open channel"))?;
        channel.exec(command).map_err(ssh_error("exec"))?;
        self.channel = Some(channel);
        Ok(())
    }

    fn collect(&mut self) -> Result<ExecutionResult, SessionError> {
        let mut channel = self
            .channel
            .take()
            .ok_or_else(|| SessionError::new("no command was started"))?;

        self.session.set_blocking(false);
        let drained = drain_streams(&mut channel);
        self.session.set_blocking(true);
        let (stdout, stderr) = drained?;
        channel.wait_close().map_err(ssh_error("wait for channel close"))?;

        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status: channel.exit_status().ok(),
        })
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.channel = None;
        self.session
            .disconnect(None, "gpurun session finished", None)
            .map_err(ssh_error("disconnect"))
    }

    fn interrupter(&self) -> Result<SessionInterrupt, SessionError> {
        let transport = self
            .transport
            .try_clone()
            .map_err(|err| SessionError::new(format!("share tcp stream: {err}")))?;
        Ok(SessionInterrupt::new(move || {
            if let Err(err) = transport.shutdown(Shutdown::Both) {
                debug!(error = %err, "ssh transport already closed");
            }
        }))
    }
}

/// Reads stdout and stderr in turn until the channel reports EOF, so a
/// workload that fills one stream cannot stall while the other is read.
/// Expects the session to be in non-blocking mode.
fn drain_streams(channel: &mut Channel) -> Result<(Vec<u8>, Vec<u8>), SessionError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buffer = [0_u8; 16 * 1024];
    loop {
        // Everything sent before EOF is buffered once EOF is seen, so the
        // pass that follows drains the rest.
        let finished = channel.eof();
        let read_out = read_available(channel, &mut buffer, &mut stdout)
            .map_err(|err| SessionError::new(format!("read stdout: {err}")))?;
        let read_err = read_available(&mut channel.stderr(), &mut buffer, &mut stderr)
            .map_err(|err| SessionError::new(format!("read stderr: {err}")))?;
        if finished {
            return Ok((stdout, stderr));
        }
        if read_out == 0 && read_err == 0 {
            thread::sleep(DRAIN_BACKOFF);
        }
    }
}

/// Appends whatever `stream` has ready to `sink` and returns the byte count.
fn read_available(
    stream: &mut impl Read,
    buffer: &mut [u8],
    sink: &mut Vec<u8>,
) -> io::Result<usize> {
    let mut total = 0_usize;
    loop {
        match stream.read(buffer) {
            Ok(0) => return Ok(total),
            Ok(read) => {
                sink.extend_from_slice(buffer.get(..read).unwrap_or_default());
                total = total.saturating_add(read);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
            Err(err) => return Err(err),
        }
    }
}

fn ssh_error(context: &'static str) -> impl FnOnce(ssh2::Error) -> SessionError {
    move |err| SessionError::new(format!("{context}: {err}"))
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}
