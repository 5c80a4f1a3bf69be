//! One-time TLS parameter setup.
//!
//! A single context is built at daemon startup and shared by every session.
//! Peers authenticate each other with X.509 certificates against a common
//! CA, in both directions; ephemeral DH parameters are mandatory and
//! regenerated per session. Failures here are fatal to the daemon, unlike
//! per-connection TLS failures which only ever cost the one connection.

use std::fs;
use std::io;

use failure::Fail;
use openssl::dh::Dh;
use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::ssl::{
    Ssl, SslContext, SslFiletype, SslMethod, SslMode, SslOptions, SslVerifyMode, SslVersion,
};
use slog::Logger;

use crate::endpoint::Config;

#[derive(Debug, Fail)]
pub enum TlsError {
    #[fail(display = "required TLS option `{}` is not set", _0)]
    Missing(&'static str),
    #[fail(display = "reading `{}` failed: {}", path, err)]
    Io { path: String, err: io::Error },
    #[fail(display = "{} failed: {}", op, err)]
    Ssl {
        op: &'static str,
        err: ErrorStack,
    },
}

fn ssl_err(op: &'static str) -> impl FnOnce(ErrorStack) -> TlsError {
    move |err| TlsError::Ssl { op, err }
}

pub struct TlsContext {
    ctx: SslContext,
}

impl TlsContext {
    pub fn new(log: &Logger, config: &Config) -> Result<Self, TlsError> {
        for &(name, value) in &[
            ("key", &config.key),
            ("cert", &config.cert),
            ("ca_cert", &config.ca_cert),
            ("dh", &config.dh),
        ] {
            if value.is_empty() {
                return Err(TlsError::Missing(name));
            }
        }

        let mut b = SslContext::builder(SslMethod::tls()).map_err(ssl_err("context setup"))?;

        if config.ssl_method == "tls" {
            info!(log, "using TLS protocol only");
            b.set_min_proto_version(Some(SslVersion::TLS1))
                .map_err(ssl_err("protocol selection"))?;
        } else {
            info!(log, "using version-flexible SSL protocol");
            b.set_options(SslOptions::NO_SSLV2);
        }

        b.set_options(SslOptions::SINGLE_DH_USE);
        // egress queues may reallocate between write retries
        b.set_mode(SslMode::ACCEPT_MOVING_WRITE_BUFFER);

        b.set_certificate_chain_file(&config.cert)
            .map_err(ssl_err("certificate loading"))?;

        match config.key_pass {
            Some(ref pass) => {
                info!(log, "TLS key passphrase loaded");
                let pem = fs::read(&config.key).map_err(|err| TlsError::Io {
                    path: config.key.clone(),
                    err,
                })?;
                let key = PKey::private_key_from_pem_passphrase(&pem, pass.as_bytes())
                    .map_err(ssl_err("key decryption"))?;
                b.set_private_key(&key).map_err(ssl_err("key loading"))?;
            }
            None => {
                b.set_private_key_file(&config.key, SslFiletype::PEM)
                    .map_err(ssl_err("key loading"))?;
            }
        }
        b.check_private_key().map_err(ssl_err("key/cert match"))?;

        b.set_ca_file(&config.ca_cert)
            .map_err(ssl_err("CA loading"))?;

        let dh_pem = fs::read(&config.dh).map_err(|err| TlsError::Io {
            path: config.dh.clone(),
            err,
        })?;
        let dh = Dh::params_from_pem(&dh_pem).map_err(ssl_err("DH parameter parsing"))?;
        info!(log, "DH parameters loaded"; "bits" => dh.prime_p().num_bits());
        b.set_tmp_dh(&dh).map_err(ssl_err("DH parameter setup"))?;

        // refuse peers without a certificate, on both ends
        b.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);

        info!(log, "TLS context initialized");
        Ok(Self { ctx: b.build() })
    }

    /// A fresh session handle for one connection; the caller picks the
    /// connect/accept direction before the handshake starts.
    pub fn new_session(&self) -> Result<Ssl, ErrorStack> {
        Ssl::new(&self.ctx)
    }
}
