//! TLS secret transform: certificate expiry in days.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::K8sObject;
use crate::sinks::zabbix::ZabbixMetric;

fn tls_cert(obj: &K8sObject) -> Option<&str> {
    obj.raw.pointer("/data/tls.crt").and_then(Value::as_str)
}

/// Days until the certificate in `data["tls.crt"]` expires. `None` when the
/// secret carries no certificate or the payload does not parse.
pub fn valid_days(obj: &K8sObject) -> Option<i64> {
    let encoded = tls_cert(obj)?;
    let pem_bytes = match BASE64.decode(encoded) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(secret = %obj.uid(), error = %e, "tls.crt is not valid base64");
            return None;
        }
    };
    let (_, pem) = match x509_parser::pem::parse_x509_pem(&pem_bytes) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(secret = %obj.uid(), error = %e, "tls.crt is not a PEM certificate");
            return None;
        }
    };
    let cert = match pem.parse_x509() {
        Ok(cert) => cert,
        Err(e) => {
            debug!(secret = %obj.uid(), error = %e, "tls.crt does not parse as X.509");
            return None;
        }
    };

    let not_after = cert.validity().not_after.timestamp();
    Some((not_after - Utc::now().timestamp()).div_euclid(86400))
}

pub(super) fn extend_canonical(obj: &K8sObject, data: &mut Map<String, Value>) {
    if let Some(days) = valid_days(obj) {
        data.insert("valid_days".to_string(), json!(days));
    }
}

pub(super) fn zabbix_metrics(obj: &K8sObject, host: &str) -> Vec<ZabbixMetric> {
    let Some(days) = valid_days(obj) else {
        return Vec::new();
    };
    let namespace = obj.namespace.as_deref().unwrap_or_default();
    vec![ZabbixMetric::new(
        host,
        format!(
            "check_kubernetesd[get,tls,{},{},valid_days]",
            namespace, obj.name
        ),
        days.to_string(),
    )]
}

/// Secrets without a certificate announce nothing.
pub(super) fn discovery_tuples(obj: &K8sObject) -> Vec<Value> {
    if tls_cert(obj).is_some() {
        vec![obj.base_discovery_tuple()]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::ResourceKind;

    // Self-signed, CN=tls-test.example.org, notAfter=2036-07-29T10:26:15Z.
    const CERT_PEM: &str = "-----BEGIN CERTIFICATE-----\n\
MIIDHzCCAgegAwIBAgIUPdw36kS32ZZ9erciaarfa44UMr8wDQYJKoZIhvcNAQEL\n\
BQAwHzEdMBsGA1UEAwwUdGxzLXRlc3QuZXhhbXBsZS5vcmcwHhcNMjYwODAxMTAy\n\
NjE1WhcNMzYwNzI5MTAyNjE1WjAfMR0wGwYDVQQDDBR0bHMtdGVzdC5leGFtcGxl\n\
Lm9yZzCCASIwDQYJKoZIhvcNAQEBBQADggEPADCCAQoCggEBALXzDccZsk0tnheP\n\
zy5CfHuq7KQ//Lhy9c+4NuRlUjo0Zvl+xQd/G1guHD5F9erVZkHti5I47XPI25kj\n\
dG+xqmuGasseyTXBHw0/ciw8vmxeku1ybY9fpf4QvngGTc8UWJoAB8DgdzJBBki3\n\
6jH0iVmqus3+087F576c+Zmwea7J6Y/zi1Tk2QOf5u6nST7Hl7sXHsyzymU34cL2\n\
UC3ha8BzsbsD1/7jeZtnnBOVe0YdOLZ9j5x0F6s1CV6D70C3VVS29BI3AqZY2Y+K\n\
oyuW2c2H2RqFA4K1CSCUc8M/+N2USWF360n3+sq9JF96ukvx7nNJOSKAHkfyv+ne\n\
oRMANJkCAwEAAaNTMFEwHQYDVR0OBBYEFGQPXcQ7O8AfalJCSAwvTrGofHkpMB8G\n\
A1UdIwQYMBaAFGQPXcQ7O8AfalJCSAwvTrGofHkpMA8GA1UdEwEB/wQFMAMBAf8w\n\
DQYJKoZIhvcNAQELBQADggEBALGx1NB6IiZh1r8r3H11xjSgPo7LomCuHzBsy9Mp\n\
5gFG05u8vkojvq9PGJkUvG+cE6LZBza1AvdufVD5wsX2j7ff/5+a1dYB1dBb768M\n\
iaacnAk6A69u4BQvBV4KeTAaEzNcSEAZXQ4H7v38sv/TlsVXN88uEOMCUoMrUkNS\n\
PnKACuMsjXP95qL9iSu5kI3CTFmXMY0WU8Ve5yTcRL4PVyKcRsHYfIVAmtoZq2hp\n\
ZIeNILiBPLuHXrBGJtOKLxbzs8Fgfsvqg18Q2yVog3/S23lZA3Z9PDUnGtEGkUiD\n\
GjZpXnOpJgywVANrHXjkQ3I6TtTvyRPFM0A+0tYhDtBYNcc=\n\
-----END CERTIFICATE-----\n";

    const CERT_NOT_AFTER: i64 = 2100939975;

    fn tls_secret(data: Value) -> K8sObject {
        K8sObject::from_raw(
            ResourceKind::Tls,
            json!({"metadata": {"name": "tls-x", "namespace": "ns"}, "data": data}),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_days_from_certificate() {
        let secret = tls_secret(json!({"tls.crt": BASE64.encode(CERT_PEM)}));
        let days = valid_days(&secret).unwrap();
        let expected = (CERT_NOT_AFTER - Utc::now().timestamp()).div_euclid(86400);
        assert_eq!(days, expected);
        assert!(days > 3000);

        let metrics = secret.zabbix_metrics("zbx");
        assert_eq!(metrics.len(), 1);
        assert_eq!(
            metrics[0].key,
            "check_kubernetesd[get,tls,ns,tls-x,valid_days]"
        );
        assert_eq!(metrics[0].value, days.to_string());
        assert_eq!(secret.discovery_tuples().len(), 1);
    }

    #[test]
    fn test_secret_without_certificate_is_silent() {
        let secret = tls_secret(json!({"username": "dXNlcg=="}));
        assert!(valid_days(&secret).is_none());
        assert!(secret.zabbix_metrics("zbx").is_empty());
        assert!(secret.discovery_tuples().is_empty());
        assert!(!secret.canonical().contains_key("valid_days"));
    }

    #[test]
    fn test_garbage_certificate_is_skipped() {
        let secret = tls_secret(json!({"tls.crt": BASE64.encode("not a certificate")}));
        assert!(valid_days(&secret).is_none());
        assert!(secret.zabbix_metrics("zbx").is_empty());
    }
}
