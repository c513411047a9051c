use std::{
    fmt,
    fs,
    net::{
        Ipv4Addr,
        SocketAddr,
    },
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use keystore::AgentDirs;
use rand::Rng;

use crate::dispatcher::EnrollmentPolicy;

#[derive(Parser, Clone)]
#[clap(author, version, about = "Agent enrollment authority")]
pub struct EnrolldConfig {
    /// Host interface to bind to
    #[clap(short, long, default_value = "0.0.0.0")]
    pub interface: Ipv4Addr,

    /// Port agents enroll on
    #[clap(short, long, default_value = "1515")]
    pub port: u16,

    /// Data directory holding client.keys and the per-agent trees
    #[clap(long, default_value = "enrolld_data")]
    pub data_dir: PathBuf,

    /// Require the shared enrollment password
    #[clap(long)]
    pub use_password: bool,

    /// Shared password file; when the password is required but the file is
    /// missing, a random password is generated and logged
    #[clap(long)]
    pub password_file: Option<PathBuf>,

    /// CA bundle used to verify client certificates
    #[clap(long)]
    pub ca_cert: Option<PathBuf>,

    /// With --ca-cert, additionally require the client certificate to
    /// match the peer address
    #[clap(long, requires = "ca_cert")]
    pub verify_host: bool,

    /// Server certificate; a self-signed pair is generated when missing
    #[clap(long)]
    pub server_cert: Option<PathBuf>,

    /// Server private key
    #[clap(long)]
    pub server_key: Option<PathBuf>,

    /// Let new enrollments supersede old records with the same name or IP
    #[clap(long)]
    pub force_insert: bool,

    /// Seconds an existing record must have been registered before
    /// force-insert may supersede it
    #[clap(long, default_value = "0")]
    pub force_time: u64,

    /// Record the socket peer address when the request names no IP
    #[clap(long)]
    pub use_source_ip: bool,

    /// Disable the agent registration ceiling
    #[clap(long)]
    pub no_limit: bool,

    /// Run as a cluster follower, forwarding enrollments to the primary
    #[clap(long, requires = "cluster_socket")]
    pub follower: bool,

    /// Unix socket of the cluster primary's RPC endpoint
    #[clap(long)]
    pub cluster_socket: Option<PathBuf>,

    /// Unix socket of the external agent-state database
    #[clap(long)]
    pub statedb_socket: Option<PathBuf>,

    /// Local administrative socket (primary only)
    #[clap(long)]
    pub admin_socket: Option<PathBuf>,

    /// Receive timeout applied to accepted sockets, in seconds; 0 disables
    #[clap(long, default_value = "1")]
    pub network_timeout: u64,

    /// Name reserved for the manager itself; defaults to the host name
    #[clap(long)]
    pub manager_name: Option<String>,

    /// JSON entity table for the integrity synchronizer; the synchronizer
    /// thread only runs when this is set
    #[clap(long)]
    pub integrity_db: Option<PathBuf>,

    /// Unix socket integrity digests are published to
    #[clap(long)]
    pub sync_socket: Option<PathBuf>,

    /// Unix socket integrity responses are received on
    #[clap(long)]
    pub sync_response_socket: Option<PathBuf>,

    /// Validate the configuration and exit
    #[clap(long)]
    pub test_config: bool,
}

impl fmt::Debug for EnrolldConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("interface", &self.interface)
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("follower", &self.follower)
            .field("force_insert", &self.force_insert)
            .field("use_password", &self.use_password)
            .finish()
    }
}

impl EnrolldConfig {
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::from((self.interface, self.port))
    }

    pub fn dirs(&self) -> AgentDirs {
        AgentDirs::new(&self.data_dir)
    }

    pub fn password_file(&self) -> PathBuf {
        self.password_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("authd.pass"))
    }

    pub fn server_cert(&self) -> PathBuf {
        self.server_cert
            .clone()
            .unwrap_or_else(|| self.data_dir.join("sslmanager.cert"))
    }

    pub fn server_key(&self) -> PathBuf {
        self.server_key
            .clone()
            .unwrap_or_else(|| self.data_dir.join("sslmanager.key"))
    }

    pub fn statedb_socket(&self) -> PathBuf {
        self.statedb_socket
            .clone()
            .unwrap_or_else(|| self.data_dir.join("statedb.sock"))
    }

    pub fn admin_socket(&self) -> PathBuf {
        self.admin_socket
            .clone()
            .unwrap_or_else(|| self.data_dir.join("enrolld.sock"))
    }

    pub fn sync_socket(&self) -> PathBuf {
        self.sync_socket
            .clone()
            .unwrap_or_else(|| self.data_dir.join("sync.sock"))
    }

    pub fn sync_response_socket(&self) -> PathBuf {
        self.sync_response_socket
            .clone()
            .unwrap_or_else(|| self.data_dir.join("sync-response.sock"))
    }

    pub fn manager_name(&self) -> String {
        self.manager_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "manager".to_owned())
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        (self.network_timeout > 0).then(|| Duration::from_secs(self.network_timeout))
    }

    /// Resolves the shared password, generating a random one when the
    /// password is required but no usable file exists.
    pub fn load_password(&self) -> anyhow::Result<Option<String>> {
        if !self.use_password {
            tracing::info!(
                "Accepting connections on port {}. No password required.",
                self.port
            );
            return Ok(None);
        }
        let path = self.password_file();
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let password = contents.lines().next().unwrap_or("").trim_end().to_owned();
                if password.len() > 2 {
                    tracing::info!(
                        "Accepting connections on port {}. Using password specified on file: {}",
                        self.port,
                        path.display()
                    );
                    return Ok(Some(password));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
        let password = hex::encode(rand::rng().random::<[u8; 16]>());
        tracing::info!(
            "Accepting connections on port {}. Random password chosen for agent \
             authentication: {password}",
            self.port
        );
        Ok(Some(password))
    }

    pub fn policy(&self, password: Option<String>) -> EnrollmentPolicy {
        EnrollmentPolicy {
            password,
            force_insert: self.force_insert,
            force_time: self.force_time,
            use_source_ip: self.use_source_ip,
            register_limit: !self.no_limit,
            manager_name: self.manager_name(),
            ..EnrollmentPolicy::default()
        }
    }
}
