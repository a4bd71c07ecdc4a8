use crate::apiserver::tls::{load_certs, load_private_key};
use crate::apiserver::SecureServingInfo;
use crate::{Error, Result};
use clap::Args;
use rcgen::{Certificate, CertificateParams, DnType, SanType};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tracing::info;

const DEFAULT_CERT_DIR: &str = "apiserver.local.config/certificates";
const PAIR_NAME: &str = "apiserver";

#[derive(Args, Clone, Debug)]
pub struct SecureServingOptions {
    #[arg(
        long,
        default_value = "0.0.0.0",
        help = "The IP address on which to listen for the --secure-port port"
    )]
    pub bind_address: IpAddr,

    #[arg(
        long,
        default_value_t = 443,
        help = "The port on which to serve HTTPS with authentication and authorization (0 disables HTTPS)"
    )]
    pub secure_port: u16,

    #[arg(long, help = "File containing the default x509 certificate for HTTPS")]
    pub tls_cert_file: Option<PathBuf>,

    #[arg(long, help = "File containing the default x509 private key matching --tls-cert-file")]
    pub tls_private_key_file: Option<PathBuf>,

    #[arg(
        long,
        default_value = DEFAULT_CERT_DIR,
        help = "Directory where generated TLS certificates are written. Ignored if --tls-cert-file and --tls-private-key-file are given"
    )]
    pub cert_dir: PathBuf,
}

impl Default for SecureServingOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            secure_port: 443,
            tls_cert_file: None,
            tls_private_key_file: None,
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
        }
    }
}

impl SecureServingOptions {
    /// Point the options at a self-signed pair in the certificate directory
    /// when no certificate was given, generating the pair if it does not
    /// exist yet.
    pub fn maybe_default_with_self_signed_certs(
        &mut self,
        public_address: &str,
        alternate_dns: &[&str],
        alternate_ips: &[IpAddr],
    ) -> Result<()> {
        if self.secure_port == 0 {
            return Ok(());
        }

        match (&self.tls_cert_file, &self.tls_private_key_file) {
            (Some(_), Some(_)) => return Ok(()),
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::Certificates(
                    "--tls-cert-file and --tls-private-key-file must be given together".to_string(),
                ))
            }
            (None, None) => {}
        }

        let cert_file = self.cert_dir.join(format!("{}.crt", PAIR_NAME));
        let key_file = self.cert_dir.join(format!("{}.key", PAIR_NAME));

        if cert_file.exists() && key_file.exists() {
            info!("Using existing self-signed certificate {}", cert_file.display());
        } else {
            let (cert_pem, key_pem) =
                generate_self_signed(public_address, alternate_dns, alternate_ips)?;

            std::fs::create_dir_all(&self.cert_dir).map_err(|e| {
                Error::Certificates(format!("creating {}: {}", self.cert_dir.display(), e))
            })?;
            std::fs::write(&cert_file, cert_pem).map_err(|e| {
                Error::Certificates(format!("writing {}: {}", cert_file.display(), e))
            })?;
            std::fs::write(&key_file, key_pem).map_err(|e| {
                Error::Certificates(format!("writing {}: {}", key_file.display(), e))
            })?;

            info!("Generated self-signed certificate in {}", cert_file.display());
        }

        self.tls_cert_file = Some(cert_file);
        self.tls_private_key_file = Some(key_file);
        Ok(())
    }

    /// Validate the TLS material and fill in the serving info. A zero port
    /// leaves serving disabled.
    pub fn apply_to(&self, serving: &mut Option<SecureServingInfo>) -> Result<()> {
        if self.secure_port == 0 {
            *serving = None;
            return Ok(());
        }

        let (cert_file, key_file) = match (&self.tls_cert_file, &self.tls_private_key_file) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => {
                return Err(Error::Serving(
                    "a serving certificate and key are required".to_string(),
                ))
            }
        };

        load_certs(&cert_file)?;
        load_private_key(&key_file)?;

        *serving = Some(SecureServingInfo {
            bind_address: SocketAddr::new(self.bind_address, self.secure_port),
            cert_file,
            key_file,
            client_ca: None,
        });
        Ok(())
    }
}

fn generate_self_signed(
    public_address: &str,
    alternate_dns: &[&str],
    alternate_ips: &[IpAddr],
) -> Result<(String, String)> {
    let mut names = vec![public_address.to_string()];
    names.extend(alternate_dns.iter().map(|n| n.to_string()));

    let mut params = CertificateParams::new(names);
    params.distinguished_name.push(
        DnType::CommonName,
        format!("{}@{}", public_address, chrono::Utc::now().timestamp()),
    );
    params
        .subject_alt_names
        .extend(alternate_ips.iter().map(|ip| SanType::IpAddress(*ip)));

    let cert = Certificate::from_params(params).map_err(|e| Error::Certificates(e.to_string()))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| Error::Certificates(e.to_string()))?;

    Ok((cert_pem, cert.serialize_private_key_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &std::path::Path) -> SecureServingOptions {
        SecureServingOptions {
            secure_port: 8443,
            cert_dir: dir.join("certs"),
            ..Default::default()
        }
    }

    #[test]
    fn test_generates_and_reuses_self_signed_pair() {
        let dir = tempfile::tempdir().unwrap();
        let localhost = [IpAddr::V4(Ipv4Addr::LOCALHOST)];

        let mut first = options(dir.path());
        first
            .maybe_default_with_self_signed_certs("localhost", &[], &localhost)
            .unwrap();
        let cert_file = first.tls_cert_file.clone().unwrap();
        let generated = std::fs::read(&cert_file).unwrap();

        let mut second = options(dir.path());
        second
            .maybe_default_with_self_signed_certs("localhost", &[], &localhost)
            .unwrap();
        assert_eq!(second.tls_cert_file.as_ref(), Some(&cert_file));
        assert_eq!(std::fs::read(&cert_file).unwrap(), generated);
    }

    #[test]
    fn test_explicit_pair_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = SecureServingOptions {
            tls_cert_file: Some(PathBuf::from("/etc/tls/tls.crt")),
            tls_private_key_file: Some(PathBuf::from("/etc/tls/tls.key")),
            ..options(dir.path())
        };
        opts.maybe_default_with_self_signed_certs("localhost", &[], &[])
            .unwrap();
        assert!(!dir.path().join("certs").exists());
    }

    #[test]
    fn test_half_pair_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = SecureServingOptions {
            tls_cert_file: Some(PathBuf::from("/etc/tls/tls.crt")),
            ..options(dir.path())
        };
        let err = opts
            .maybe_default_with_self_signed_certs("localhost", &[], &[])
            .unwrap_err();
        assert!(matches!(err, Error::Certificates(_)));
    }

    #[test]
    fn test_apply_to() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let mut serving = None;
        assert!(matches!(opts.apply_to(&mut serving), Err(Error::Serving(_))));

        opts.maybe_default_with_self_signed_certs("localhost", &[], &[])
            .unwrap();
        opts.apply_to(&mut serving).unwrap();
        let serving = serving.unwrap();
        assert_eq!(serving.bind_address, "127.0.0.1:8443".parse().unwrap());
        assert!(serving.client_ca.is_none());
    }

    #[test]
    fn test_zero_port_disables_serving() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = SecureServingOptions {
            secure_port: 0,
            ..options(dir.path())
        };
        opts.maybe_default_with_self_signed_certs("localhost", &[], &[])
            .unwrap();
        assert!(opts.tls_cert_file.is_none());

        let mut serving = None;
        opts.apply_to(&mut serving).unwrap();
        assert!(serving.is_none());
    }
}
