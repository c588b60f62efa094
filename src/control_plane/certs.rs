use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const CA_COMMON_NAME: &str = "envtest-ca";
const SERVING_COMMON_NAME: &str = "kube-apiserver";
pub(crate) const ADMIN_USER: &str = "envtest-admin";
/// Group bound to the `cluster-admin` role by the api-server bootstrap policy.
const ADMIN_GROUP: &str = "system:masters";

/// PEM encoded credentials generated for a single control plane run.
pub(crate) struct ControlPlaneCerts {
    pub ca_cert: String,
    pub serving_cert: String,
    pub serving_key: String,
    pub client_cert: String,
    pub client_key: String,
    pub service_account_key: String,
    pub service_account_pub: String,
}

/// Locations of the credentials once written to the control plane directory.
pub(crate) struct CertPaths {
    pub ca_cert: PathBuf,
    pub serving_cert: PathBuf,
    pub serving_key: PathBuf,
    pub service_account_key: PathBuf,
    pub service_account_pub: PathBuf,
}

impl ControlPlaneCerts {
    /// Generates a CA, a serving certificate for the loopback addresses, an admin client certificate and the
    /// service-account signing key.
    pub fn generate() -> Result<Self, rcgen::Error> {
        let ca_key = KeyPair::generate()?;
        let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
        ca_params.distinguished_name = distinguished_name(CA_COMMON_NAME, None);
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = ca_params.clone().self_signed(&ca_key)?;
        let issuer = Issuer::new(ca_params, ca_key);

        let serving_key = KeyPair::generate()?;
        let mut serving_params =
            CertificateParams::new(vec!["127.0.0.1".to_string(), "localhost".to_string()])?;
        serving_params.distinguished_name = distinguished_name(SERVING_COMMON_NAME, None);
        serving_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let serving_cert = serving_params.signed_by(&serving_key, &issuer)?;

        let client_key = KeyPair::generate()?;
        let mut client_params = CertificateParams::new(Vec::<String>::new())?;
        client_params.distinguished_name = distinguished_name(ADMIN_USER, Some(ADMIN_GROUP));
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_cert = client_params.signed_by(&client_key, &issuer)?;

        let service_account = KeyPair::generate()?;

        Ok(Self {
            ca_cert: ca_cert.pem(),
            serving_cert: serving_cert.pem(),
            serving_key: serving_key.serialize_pem(),
            client_cert: client_cert.pem(),
            client_key: client_key.serialize_pem(),
            service_account_key: service_account.serialize_pem(),
            service_account_pub: service_account.public_key_pem(),
        })
    }

    /// Writes the files the api-server reads into `dir`. Client credentials are only embedded in the kubeconfig.
    pub fn write_to(&self, dir: &Path) -> io::Result<CertPaths> {
        let paths = CertPaths {
            ca_cert: dir.join("ca.crt"),
            serving_cert: dir.join("apiserver.crt"),
            serving_key: dir.join("apiserver.key"),
            service_account_key: dir.join("sa-signer.key"),
            service_account_pub: dir.join("sa-signer.pub"),
        };
        fs::write(&paths.ca_cert, &self.ca_cert)?;
        fs::write(&paths.serving_cert, &self.serving_cert)?;
        fs::write(&paths.serving_key, &self.serving_key)?;
        fs::write(&paths.service_account_key, &self.service_account_key)?;
        fs::write(&paths.service_account_pub, &self.service_account_pub)?;
        Ok(paths)
    }
}

fn distinguished_name(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    if let Some(organization) = organization {
        dn.push(DnType::OrganizationName, organization);
    }
    dn
}
