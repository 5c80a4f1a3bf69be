//! Shared test helpers: a discard logger, recording fakes for the poller
//! and route layer contracts, and throwaway TLS credentials generated once
//! per test run.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::os::unix::io::RawFd;

use lazy_static::lazy_static;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::dh::Dh;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509NameBuilder, X509};
use slog::{Discard, Drain, Logger};

use crate::connection::{Connection, ConnectionHandle};
use crate::endpoint::Config;
use crate::poll::{PollEvent, PollSet};
use crate::routes::{HwAddr, Routes};

/// Quiet by default; set `TEST_LOG` to watch the endpoints talk.
pub fn logger() -> Logger {
    if std::env::var_os("TEST_LOG").is_some() {
        let decorator = slog_term::PlainSyncDecorator::new(io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, o!())
    } else {
        Logger::root(Discard, o!())
    }
}

pub struct Credentials {
    pub cert: String,
    pub key: String,
    pub dh: String,
}

lazy_static! {
    static ref CREDENTIALS: Credentials = generate_credentials();
}

/// Self-signed peer credentials, shared by every test in the run. The
/// certificate doubles as its own CA.
pub fn credentials() -> &'static Credentials {
    &CREDENTIALS
}

pub fn config_with_creds(creds: &Credentials) -> Config {
    let mut config = Config::default();
    config.key = creds.key.clone();
    config.cert = creds.cert.clone();
    config.ca_cert = creds.cert.clone();
    config.dh = creds.dh.clone();
    config
}

fn generate_credentials() -> Credentials {
    let dir = std::env::temp_dir().join(format!("meshlink-proto-test-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();

    let rsa = Rsa::generate(2048).unwrap();
    let pkey = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "meshlink test peer").unwrap();
    let name = name.build();

    let mut cert = X509::builder().unwrap();
    cert.set_version(2).unwrap();
    cert.set_subject_name(&name).unwrap();
    cert.set_issuer_name(&name).unwrap();
    cert.set_pubkey(&pkey).unwrap();
    cert.set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    cert.set_not_after(&Asn1Time::days_from_now(7).unwrap())
        .unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    cert.set_serial_number(&serial).unwrap();
    cert.append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    cert.sign(&pkey, MessageDigest::sha256()).unwrap();
    let cert = cert.build();

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    let dh_path = dir.join("dh.pem");
    fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
    fs::write(&key_path, pkey.private_key_to_pem_pkcs8().unwrap()).unwrap();
    // well-known group, so tests skip parameter generation
    let dh = Dh::get_2048_256().unwrap();
    fs::write(&dh_path, dh.params_to_pem().unwrap()).unwrap();

    Credentials {
        cert: cert_path.to_string_lossy().into_owned(),
        key: key_path.to_string_lossy().into_owned(),
        dh: dh_path.to_string_lossy().into_owned(),
    }
}

/// Records interest changes instead of talking to a kernel poller.
#[derive(Default)]
pub struct FakePoll {
    pub read: BTreeSet<RawFd>,
    pub write: BTreeSet<RawFd>,
}

impl FakePoll {
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }
}

impl PollSet for FakePoll {
    fn add_read(&mut self, fd: RawFd) {
        self.read.insert(fd);
    }

    fn add_write(&mut self, fd: RawFd) {
        self.write.insert(fd);
    }

    fn remove_read(&mut self, fd: RawFd) {
        self.read.remove(&fd);
    }

    fn remove_write(&mut self, fd: RawFd) {
        self.write.remove(&fd);
    }

    fn wait(&mut self, _usec: u64, out: &mut Vec<PollEvent>) -> io::Result<()> {
        out.clear();
        Ok(())
    }
}

/// Records everything the core hands to the route layer; announces
/// `local_routes` back when a link comes up.
#[derive(Default)]
pub struct FakeRoutes {
    pub dirty: usize,
    pub packets: Vec<(Vec<u8>, ConnectionHandle)>,
    pub broadcasts: Vec<(u32, Vec<u8>, ConnectionHandle)>,
    pub local_routes: Vec<(HwAddr, u32)>,
}

impl Routes for FakeRoutes {
    fn packet(&mut self, buf: &[u8], from: ConnectionHandle) {
        self.packets.push((buf.to_vec(), from));
    }

    fn broadcast_packet(&mut self, id: u32, buf: &[u8], from: ConnectionHandle) {
        self.broadcasts.push((id, buf.to_vec(), from));
    }

    fn set_dirty(&mut self) {
        self.dirty += 1;
    }

    fn report_to(&mut self, conn: &mut Connection, poll: &mut dyn PollSet) {
        let entries = self.local_routes.clone();
        conn.write_route_set(&entries, poll, self);
    }
}
