//! Add-on deployment: MetalLB and ingress-nginx.
//!
//! Both are Helm charts installed through the chart installer; MetalLB
//! also needs its address pool objects applied once its CRDs are served.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{first_address, Addons, IngressSpec, LoadBalancerSpec};
use crate::error::{Error, Result};
use crate::exec::{ClusterClients, Release, ReleaseSpec, ReleaseStatus};
use crate::wait::{wait_until, WaitOptions, DEFAULT_POLL_INTERVAL};

/// MetalLB Helm repository.
pub const METALLB_REPO: &str = "https://metallb.github.io/metallb";
/// MetalLB chart reference.
pub const METALLB_CHART: &str = "metallb/metallb";
/// Namespace MetalLB is installed into.
pub const METALLB_NAMESPACE: &str = "metallb-system";
/// MetalLB release name.
pub const METALLB_RELEASE: &str = "metallb";
const METALLB_CONTROLLER: &str = "metallb-controller";
const METALLB_POOL_CRD: &str = "ipaddresspools.metallb.io";

/// Name of the address pool object.
pub const POOL_NAME: &str = "default-pool";

/// Name of the L2 advertisement object.
pub const L2_ADVERTISEMENT_NAME: &str = "default-l2";

/// ingress-nginx Helm repository.
pub const INGRESS_REPO: &str = "https://kubernetes.github.io/ingress-nginx";
/// ingress-nginx chart reference.
pub const INGRESS_CHART: &str = "ingress-nginx/ingress-nginx";
/// Namespace ingress-nginx is installed into.
pub const INGRESS_NAMESPACE: &str = "ingress-nginx";
/// ingress-nginx release name.
pub const INGRESS_RELEASE: &str = "ingress-nginx";

/// Default wait for MetalLB to come up.
pub const DEFAULT_ADDON_TIMEOUT: Duration = Duration::from_secs(120);

/// IP the ingress service should claim: the explicit one, else the first
/// address of the load balancer pool.
///
/// # Errors
///
/// Returns [`Error::Validation`] if either address is malformed.
pub fn ingress_address(addons: &Addons) -> Result<Option<IpAddr>> {
    if let Some(ip) = addons.enabled_ingress().and_then(|i| i.ip.as_deref()) {
        let ip = ip
            .parse()
            .map_err(|_| Error::validation(format!("ingress ip '{ip}' is not an IP address")))?;
        return Ok(Some(ip));
    }
    addons
        .enabled_load_balancer()
        .map(|lb| first_address(&lb.ip_range))
        .transpose()
}

/// `IPAddressPool` plus `L2Advertisement` for `ip_range`.
#[must_use]
pub fn address_pool_manifest(ip_range: &str) -> String {
    format!(
        r#"apiVersion: metallb.io/v1beta1
kind: IPAddressPool
metadata:
  name: {POOL_NAME}
  namespace: {METALLB_NAMESPACE}
spec:
  addresses:
    - "{ip_range}"
---
apiVersion: metallb.io/v1beta1
kind: L2Advertisement
metadata:
  name: {L2_ADVERTISEMENT_NAME}
  namespace: {METALLB_NAMESPACE}
spec:
  ipAddressPools:
    - {POOL_NAME}
"#
    )
}

/// ingress-nginx values exposing the controller as a `LoadBalancer`.
///
/// # Errors
///
/// Returns an error if the values cannot be serialized.
pub fn ingress_values(load_balancer_ip: Option<IpAddr>) -> Result<String> {
    let mut service = json!({ "type": "LoadBalancer" });
    if let Some(ip) = load_balancer_ip {
        service["loadBalancerIP"] = json!(ip.to_string());
        service["annotations"] = json!({ "metallb.universe.tf/loadBalancerIPs": ip.to_string() });
    }
    let values = json!({ "controller": { "service": service } });
    Ok(serde_yaml::to_string(&values)?)
}

fn deployment_ready(json: &str) -> Result<bool> {
    let doc: serde_json::Value = serde_json::from_str(json)?;
    let wanted = doc["spec"]["replicas"].as_u64().unwrap_or(1).max(1);
    let ready = doc["status"]["readyReplicas"].as_u64().unwrap_or(0);
    Ok(ready >= wanted)
}

/// Installs add-ons into one cluster.
pub struct AddonDeployer {
    clients: ClusterClients,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
}

impl AddonDeployer {
    /// Deploy through `clients` with default timings.
    #[must_use]
    pub fn new(clients: ClusterClients) -> Self {
        Self {
            clients,
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_ADDON_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    /// Override the polling interval and the readiness timeout.
    #[must_use]
    pub fn with_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.interval = interval;
        self.timeout = timeout;
        self
    }

    /// Stop waiting when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn wait_options(&self) -> WaitOptions {
        WaitOptions::new(self.timeout).with_interval(self.interval)
    }

    fn release(
        &self,
        name: &str,
        chart: &str,
        namespace: &str,
        version: Option<&str>,
    ) -> ReleaseSpec {
        ReleaseSpec {
            release_name: name.to_string(),
            chart: chart.to_string(),
            version: version.map(str::to_string),
            namespace: namespace.to_string(),
            values_yaml: String::new(),
            create_namespace: true,
            wait: true,
            timeout: self.timeout,
            atomic: false,
        }
    }

    async fn install(&self, spec: &ReleaseSpec) -> Result<Release> {
        let release = self.clients.charts.install_or_upgrade(spec).await?;
        if release.status == ReleaseStatus::Failed {
            return Err(Error::command(
                format!("install {}", spec.release_name),
                "release is in failed state",
            ));
        }
        if release.status.is_pending() {
            info!("Release {} is {:?}, waiting...", spec.release_name, release.status);
            return self.chart_status(&spec.release_name, &spec.namespace).await;
        }
        Ok(release)
    }

    /// Deploy every enabled add-on, load balancer first.
    ///
    /// # Errors
    ///
    /// Returns the first failing install or wait.
    pub async fn deploy_all(&self, addons: &Addons) -> Result<()> {
        if let Some(lb) = addons.enabled_load_balancer() {
            self.deploy_load_balancer(lb).await?;
        }
        if let Some(ingress) = addons.enabled_ingress() {
            self.deploy_ingress(ingress, ingress_address(addons)?).await?;
        }
        Ok(())
    }

    /// Install MetalLB and configure its address pool.
    ///
    /// # Errors
    ///
    /// Fails if the chart install fails or MetalLB is not ready in time.
    pub async fn deploy_load_balancer(&self, spec: &LoadBalancerSpec) -> Result<()> {
        info!("Deploying MetalLB...");
        first_address(&spec.ip_range)?;

        self.clients
            .charts
            .add_repository("metallb", METALLB_REPO)
            .await?;
        let release = self.release(
            METALLB_RELEASE,
            METALLB_CHART,
            METALLB_NAMESPACE,
            spec.chart_version.as_deref(),
        );
        self.install(&release).await?;

        // The pool objects are rejected until the CRD and its webhook are up.
        let kube = &self.clients.kube;
        wait_until("MetalLB controller", self.wait_options(), &self.cancel, move || async move {
            kube.get("crd", METALLB_POOL_CRD, "").await?;
            let deployment = kube
                .get("deployment", METALLB_CONTROLLER, METALLB_NAMESPACE)
                .await?;
            deployment_ready(&deployment)
        })
        .await?;

        self.clients
            .kube
            .apply(&address_pool_manifest(&spec.ip_range))
            .await?;
        info!("✅ MetalLB deployed with pool {}", spec.ip_range);
        Ok(())
    }

    /// Install ingress-nginx behind a `LoadBalancer` service, optionally
    /// pinned to `load_balancer_ip`.
    ///
    /// # Errors
    ///
    /// Fails if the chart install fails.
    pub async fn deploy_ingress(
        &self,
        spec: &IngressSpec,
        load_balancer_ip: Option<IpAddr>,
    ) -> Result<()> {
        info!("Deploying ingress-nginx...");
        self.clients
            .charts
            .add_repository("ingress-nginx", INGRESS_REPO)
            .await?;

        let mut release = self.release(
            INGRESS_RELEASE,
            INGRESS_CHART,
            INGRESS_NAMESPACE,
            spec.chart_version.as_deref(),
        );
        release.values_yaml = ingress_values(load_balancer_ip)?;
        self.install(&release).await?;

        match load_balancer_ip {
            Some(ip) => info!("✅ ingress-nginx deployed at {ip}"),
            None => info!("✅ ingress-nginx deployed"),
        }
        Ok(())
    }

    /// Wait for a release to settle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Command`] if the release ends up failed, or
    /// [`Error::Timeout`] if it stays pending.
    pub async fn chart_status(&self, release: &str, namespace: &str) -> Result<Release> {
        let last: Mutex<Option<Release>> = Mutex::new(None);
        let (charts, slot) = (&self.clients.charts, &last);
        let what = format!("release {namespace}/{release}");

        wait_until(&what, self.wait_options(), &self.cancel, move || async move {
            let current = charts.get_release(release, namespace).await?;
            debug!(release, status = ?current.status, "Release status");
            let settled = matches!(current.status, ReleaseStatus::Deployed | ReleaseStatus::Failed);
            if let Ok(mut guard) = slot.lock() {
                *guard = Some(current);
            }
            Ok(settled)
        })
        .await?;

        let release_info = last
            .into_inner()
            .ok()
            .flatten()
            .ok_or_else(|| Error::command("helm status", format!("no status for {release}")))?;
        if release_info.status == ReleaseStatus::Failed {
            return Err(Error::command(
                format!("release {namespace}/{release}"),
                "release is in failed state",
            ));
        }
        Ok(release_info)
    }
}
