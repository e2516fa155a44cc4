//! Creating and destroying NIC bonds across a pool.

use crate::capability::{CapabilityCheck, ObjectExists, ObjectsNotLocked};
use crate::composite::{run_steps, Compensation, Completed, Step};
use crate::context::OperationContext;
use crate::error::{OperationError, OperationResult};
use crate::operation::Operation;
use crate::progress::ProgressRange;
use async_trait::async_trait;
use poolsync_core::{views, ObjectStore};
use poolsync_protocol::{ObjectRef, ObjectType, ProtocolError, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Bonding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BondMode {
    /// Source-load balancing.
    #[default]
    BalanceSlb,
    /// One active member, the rest standby.
    ActiveBackup,
    /// 802.3ad link aggregation.
    Lacp,
}

impl BondMode {
    /// The mode's wire name.
    pub fn wire_name(self) -> &'static str {
        match self {
            BondMode::BalanceSlb => "balance-slb",
            BondMode::ActiveBackup => "active-backup",
            BondMode::Lacp => "lacp",
        }
    }
}

impl fmt::Display for BondMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// What to bond.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondRequest {
    /// Name of the network the bonds attach to.
    pub network_name: String,
    /// Devices to bond on every host, e.g. `eth1`, `eth2`.
    pub devices: Vec<String>,
    /// Bonding mode.
    pub mode: BondMode,
}

impl BondRequest {
    /// Creates a request with the default mode.
    pub fn new<I, S>(network_name: impl Into<String>, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            network_name: network_name.into(),
            devices: devices.into_iter().map(Into::into).collect(),
            mode: BondMode::default(),
        }
    }

    /// Sets the mode.
    pub fn with_mode(mut self, mode: BondMode) -> Self {
        self.mode = mode;
        self
    }
}

/// The bond to build on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBondPlan {
    /// Host.
    pub host: ObjectRef,
    /// Host display name.
    pub host_name: String,
    /// Member PIFs, in device order.
    pub members: Vec<ObjectRef>,
    /// MAC the bond takes, that of the first member.
    pub mac: String,
    /// The member carrying the management interface, if any.
    pub management: Option<ObjectRef>,
    /// Whether this host is the coordinator.
    pub coordinator: bool,
}

/// Per-host plans, in execution order: coordinator last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondPlan {
    /// Host plans.
    pub hosts: Vec<HostBondPlan>,
}

impl BondPlan {
    /// Every member PIF across the pool.
    pub fn members(&self) -> impl Iterator<Item = &ObjectRef> {
        self.hosts.iter().flat_map(|h| h.members.iter())
    }
}

/// Works out, from the store alone, what a bond request needs on each host.
pub fn plan_bond(store: &ObjectStore, request: &BondRequest) -> OperationResult<BondPlan> {
    if request.devices.len() < 2 {
        return Err(OperationError::Planning("a bond needs at least two devices".into()));
    }
    let pool = views::pool(store).ok_or_else(|| OperationError::Planning("pool not loaded".into()))?;
    let hosts = views::hosts(store);
    if hosts.is_empty() {
        return Err(OperationError::Planning("pool has no hosts".into()));
    }

    let mut plans = Vec::with_capacity(hosts.len());
    for host in hosts {
        let pifs = views::pifs_on_host(store, &host.reference);
        let mut members = Vec::with_capacity(request.devices.len());
        for device in &request.devices {
            let pif = pifs
                .iter()
                .find(|p| &p.device == device && p.physical && p.bond_slave_of.is_none())
                .ok_or_else(|| {
                    OperationError::Planning(format!("host {} has no free {device}", host.name))
                })?;
            members.push(pif.clone());
        }
        plans.push(HostBondPlan {
            coordinator: pool.coordinator.as_ref() == Some(&host.reference),
            host: host.reference,
            host_name: host.name,
            mac: members[0].mac.clone(),
            management: members.iter().find(|p| p.management).map(|p| p.reference.clone()),
            members: members.into_iter().map(|p| p.reference).collect(),
        });
    }
    // Stable: members keep reference order, the coordinator moves to the end.
    plans.sort_by_key(|p| p.coordinator);
    Ok(BondPlan { hosts: plans })
}

struct CreateNetwork {
    name: String,
}

#[async_trait]
impl Step for CreateNetwork {
    fn describe(&self) -> String {
        format!("create network {}", self.name)
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        _range: ProgressRange,
        _earlier: &[Completed],
    ) -> OperationResult<Completed> {
        let spec = Value::map([("name_label", Value::from(self.name.as_str()))]);
        let network = ctx
            .call("network.create", vec![spec])
            .await?
            .as_object_ref()
            .ok_or(ProtocolError::UnexpectedShape {
                expected: "network reference",
            })?;
        debug!(%network, "network created");
        Ok(Completed::created(
            network.clone(),
            Compensation::call("network.destroy", vec![Value::from(network)]),
        ))
    }
}

struct CreateHostBond {
    plan: HostBondPlan,
    mode: BondMode,
}

#[async_trait]
impl Step for CreateHostBond {
    fn describe(&self) -> String {
        format!("bond on {}", self.plan.host_name)
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        range: ProgressRange,
        earlier: &[Completed],
    ) -> OperationResult<Completed> {
        // The network always comes from the first step.
        let network = earlier
            .first()
            .and_then(|c| c.created.clone())
            .ok_or_else(|| OperationError::Planning("bond network was not created".into()))?;
        let params = vec![
            Value::from(network),
            Value::from(self.plan.members.clone()),
            Value::from(self.plan.mac.as_str()),
            Value::from(self.mode.wire_name()),
        ];
        let bond = ctx
            .run_task("Async.Bond.create", params, range)
            .await?
            .as_object_ref()
            .ok_or(ProtocolError::UnexpectedShape {
                expected: "bond reference",
            })?;
        info!(host = %self.plan.host_name, %bond, "bond created");
        Ok(Completed::created(
            bond.clone(),
            Compensation::async_call("Async.Bond.destroy", vec![Value::from(bond)]),
        ))
    }
}

struct MoveManagement {
    host_name: String,
    original: ObjectRef,
}

#[async_trait]
impl Step for MoveManagement {
    fn describe(&self) -> String {
        format!("move management on {}", self.host_name)
    }

    async fn execute(
        &self,
        ctx: &OperationContext,
        _range: ProgressRange,
        earlier: &[Completed],
    ) -> OperationResult<Completed> {
        // Always runs straight after the bond step for the same host.
        let bond = earlier
            .last()
            .and_then(|c| c.created.clone())
            .ok_or_else(|| OperationError::Planning("bond was not created".into()))?;
        let master = ctx
            .wait_until(ctx.config().object_wait_timeout, |store| {
                views::bond(store, &bond).and_then(|b| b.master)
            })
            .await
            .ok_or_else(|| OperationError::Timeout(format!("master of bond {bond} never appeared")))?;

        ctx.call("host.management_reconfigure", vec![Value::from(&master)])
            .await?;
        info!(host = %self.host_name, pif = %master, "management moved to bond");
        Ok(Completed::done(Compensation::call(
            "host.management_reconfigure",
            vec![Value::from(&self.original)],
        )))
    }
}

/// Creates a network and bonds the requested devices on every host onto it.
///
/// Hosts run one after another with the coordinator last. If any step
/// fails, everything done so far is undone in reverse order.
pub struct CreateBondOperation {
    request: BondRequest,
    plan: BondPlan,
}

impl CreateBondOperation {
    /// Plans the operation. Fails if any host lacks a free device.
    pub fn new(request: BondRequest, store: &ObjectStore) -> OperationResult<Self> {
        let plan = plan_bond(store, &request)?;
        Ok(Self { request, plan })
    }

    /// Returns the plan.
    pub fn plan(&self) -> &BondPlan {
        &self.plan
    }

    fn steps(&self) -> Vec<Box<dyn Step>> {
        let mut steps: Vec<Box<dyn Step>> = vec![Box::new(CreateNetwork {
            name: self.request.network_name.clone(),
        })];
        for host in &self.plan.hosts {
            steps.push(Box::new(CreateHostBond {
                plan: host.clone(),
                mode: self.request.mode,
            }));
            if let Some(original) = &host.management {
                steps.push(Box::new(MoveManagement {
                    host_name: host.host_name.clone(),
                    original: original.clone(),
                }));
            }
        }
        steps
    }
}

#[async_trait]
impl Operation for CreateBondOperation {
    fn title(&self) -> String {
        format!("Create bond {}", self.request.network_name)
    }

    fn description(&self) -> String {
        format!(
            "Bond {} on {} hosts ({})",
            self.request.devices.join("+"),
            self.plan.hosts.len(),
            self.request.mode
        )
    }

    fn capability_checks(&self) -> Vec<Arc<dyn CapabilityCheck>> {
        let mut checks: Vec<Arc<dyn CapabilityCheck>> = vec![Arc::new(
            ObjectsNotLocked::new().with_all(ObjectType::Pif, self.plan.members().cloned()),
        )];
        for host in &self.plan.hosts {
            checks.push(Arc::new(ObjectExists::new(ObjectType::Host, host.host.clone())));
        }
        checks
    }

    async fn run(&self, ctx: &OperationContext) -> OperationResult<Option<Value>> {
        for pif in self.plan.members() {
            if !ctx.lock(ObjectType::Pif, pif.clone()) {
                return Err(OperationError::CapabilityCheckFailed(format!("PIF {pif} is in use")));
            }
        }

        let completed = run_steps(ctx, &self.steps(), ProgressRange::FULL).await?;
        let network = completed.first().and_then(|c| c.created.clone());
        let bonds: Vec<Value> = completed
            .iter()
            .skip(1)
            .filter_map(|c| c.created.clone())
            .map(Value::Ref)
            .collect();
        Ok(Some(Value::map([
            ("network", network.map(Value::Ref).unwrap_or(Value::Null)),
            ("bonds", Value::Array(bonds)),
        ])))
    }
}

#[derive(Debug, Clone)]
struct BondTeardown {
    bond: ObjectRef,
    host_name: String,
    /// First member; management moves here if it sat on the bond.
    fallback: Option<ObjectRef>,
    management_on_master: bool,
}

/// Destroys every bond on a network, coordinator last, then the network.
///
/// Not compensable: cancellation is honoured between bonds and leaves what
/// was already destroyed destroyed.
pub struct DestroyBondOperation {
    network: ObjectRef,
    network_name: String,
    bonds: Vec<BondTeardown>,
}

impl DestroyBondOperation {
    /// Plans the teardown from the store.
    pub fn new(network: ObjectRef, store: &ObjectStore) -> OperationResult<Self> {
        let view = views::network(store, &network)
            .ok_or_else(|| OperationError::Planning(format!("network {network} not found")))?;
        let coordinator = views::pool(store).and_then(|p| p.coordinator);

        let mut bonds: Vec<(bool, BondTeardown)> = views::bonds_on_network(store, &network)
            .into_iter()
            .map(|bond| {
                let host = views::bond_host(store, &bond);
                let host_name = host
                    .as_ref()
                    .and_then(|h| views::host(store, h))
                    .map(|h| h.name)
                    .unwrap_or_default();
                let management_on_master = bond
                    .master
                    .as_ref()
                    .and_then(|m| views::pif(store, m))
                    .is_some_and(|p| p.management);
                let is_coordinator = host.is_some() && host == coordinator;
                (
                    is_coordinator,
                    BondTeardown {
                        bond: bond.reference,
                        host_name,
                        fallback: bond.slaves.first().cloned(),
                        management_on_master,
                    },
                )
            })
            .collect();
        bonds.sort_by_key(|(is_coordinator, _)| *is_coordinator);

        Ok(Self {
            network,
            network_name: view.name,
            bonds: bonds.into_iter().map(|(_, b)| b).collect(),
        })
    }

    /// Number of bonds that will be destroyed.
    pub fn bond_count(&self) -> usize {
        self.bonds.len()
    }
}

#[async_trait]
impl Operation for DestroyBondOperation {
    fn title(&self) -> String {
        format!("Destroy bond {}", self.network_name)
    }

    fn capability_checks(&self) -> Vec<Arc<dyn CapabilityCheck>> {
        vec![
            Arc::new(ObjectExists::new(ObjectType::Network, self.network.clone())),
            Arc::new(
                ObjectsNotLocked::new()
                    .with_all(ObjectType::Bond, self.bonds.iter().map(|b| b.bond.clone())),
            ),
        ]
    }

    async fn run(&self, ctx: &OperationContext) -> OperationResult<Option<Value>> {
        for teardown in &self.bonds {
            if !ctx.lock(ObjectType::Bond, teardown.bond.clone()) {
                return Err(OperationError::CapabilityCheckFailed(format!(
                    "bond {} is in use",
                    teardown.bond
                )));
            }
        }

        let parts = self.bonds.len() + 1;
        for (index, teardown) in self.bonds.iter().enumerate() {
            ctx.check_cancelled()?;
            if teardown.management_on_master {
                if let Some(fallback) = &teardown.fallback {
                    ctx.call("host.management_reconfigure", vec![Value::from(fallback)])
                        .await?;
                }
            }
            ctx.run_task(
                "Async.Bond.destroy",
                vec![Value::from(&teardown.bond)],
                ProgressRange::FULL.slice(index, parts),
            )
            .await?;
            info!(host = %teardown.host_name, bond = %teardown.bond, "bond destroyed");
        }

        ctx.check_cancelled()?;
        ctx.call("network.destroy", vec![Value::from(&self.network)])
            .await?;
        Ok(None)
    }
}
