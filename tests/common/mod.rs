//! Small analytic regions, boundaries and circuits shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use mixddm::solver::damping::KB_OVER_Q;
use mixddm::{
    BoundaryCondition, CircuitEngine, Comm, Coupling, DistributedVector, DofMap, EvalContext, LocalVector, MixError, NodeId,
    Region, RegionRole, Result, RowRequests, TripletBuffer, VectorBuffer, slot,
};

/// One semiconductor node pinned to `psi0` with Boltzmann carrier densities:
/// f0 = ψ − ψ0, f1 = n − exp(ψ/Vt), f2 = p − exp(−ψ/Vt).
pub struct BoltzmannNode {
    pub node: NodeId,
    pub psi0: f64,
    pub state: [f64; 3],
    nodes: Vec<NodeId>,
}

impl BoltzmannNode {
    pub fn new(node: NodeId, psi0: f64) -> Self {
        Self { node, psi0, state: [0.0, 1.0, 1.0], nodes: vec![node] }
    }

    pub fn thermal_voltage(t: f64) -> f64 {
        KB_OVER_Q * t
    }
}

impl Region for BoltzmannNode {
    fn name(&self) -> &str {
        "boltzmann"
    }
    fn role(&self) -> RegionRole {
        RegionRole::Semiconductor
    }
    fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }
    fn fill_initial_value(&self, dofs: &DofMap, x: &mut DistributedVector, _scaling: &mut DistributedVector) {
        let node = dofs.node(self.node).unwrap();
        for s in 0..3 {
            x.set(node.index(s), self.state[s]);
        }
    }
    fn evaluate_residual(&self, ctx: &EvalContext<'_>, x: &LocalVector, r: &mut VectorBuffer) -> Result<()> {
        let vt = Self::thermal_voltage(ctx.t_external);
        let node = ctx.dofs.node(self.node)?;
        let psi = x[node.potential()];
        r.add(node.potential(), psi - self.psi0);
        r.add(node.index(slot::ELECTRON), x[node.index(slot::ELECTRON)] - (psi / vt).exp());
        r.add(node.index(slot::HOLE), x[node.index(slot::HOLE)] - (-psi / vt).exp());
        Ok(())
    }
    fn evaluate_jacobian(&self, ctx: &EvalContext<'_>, x: &LocalVector, j: &mut TripletBuffer) -> Result<()> {
        let vt = Self::thermal_voltage(ctx.t_external);
        let node = ctx.dofs.node(self.node)?;
        let (i0, i1, i2) = (node.potential(), node.index(slot::ELECTRON), node.index(slot::HOLE));
        let psi = x[i0];
        j.add(i0, i0, 1.0);
        j.add(i1, i0, -(psi / vt).exp() / vt);
        j.add(i1, i1, 1.0);
        j.add(i2, i0, (-psi / vt).exp() / vt);
        j.add(i2, i2, 1.0);
        Ok(())
    }
    fn update_solution(&mut self, dofs: &DofMap, x: &LocalVector) {
        let node = dofs.node(self.node).unwrap();
        for s in 0..3 {
            self.state[s] = x[node.index(s)];
        }
    }
}

/// Carrier relaxation towards 1 with lifetime `tau`: f = dn/dt + (n − 1)/τ, ψ = 0.
pub struct Relaxation {
    pub node: NodeId,
    pub tau: f64,
    pub state: [f64; 3],
    /// Poison the first time-dependent evaluation past this time.
    pub fail_after: Option<f64>,
    failed: AtomicBool,
    nodes: Vec<NodeId>,
}

impl Relaxation {
    pub fn new(node: NodeId, tau: f64, n0: f64) -> Self {
        Self {
            node,
            tau,
            state: [0.0, n0, n0],
            fail_after: None,
            failed: AtomicBool::new(false),
            nodes: vec![node],
        }
    }

    pub fn failing_after(mut self, t: f64) -> Self {
        self.fail_after = Some(t);
        self
    }
}

impl Region for Relaxation {
    fn name(&self) -> &str {
        "relaxation"
    }
    fn role(&self) -> RegionRole {
        RegionRole::Semiconductor
    }
    fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }
    fn fill_initial_value(&self, dofs: &DofMap, x: &mut DistributedVector, scaling: &mut DistributedVector) {
        let node = dofs.node(self.node).unwrap();
        for s in 0..3 {
            x.set(node.index(s), self.state[s]);
        }
        scaling.set(node.index(slot::ELECTRON), self.tau);
        scaling.set(node.index(slot::HOLE), self.tau);
    }
    fn evaluate_residual(&self, ctx: &EvalContext<'_>, x: &LocalVector, r: &mut VectorBuffer) -> Result<()> {
        let node = ctx.dofs.node(self.node)?;
        r.add(node.potential(), x[node.potential()]);
        for s in [slot::ELECTRON, slot::HOLE] {
            let i = node.index(s);
            r.add(i, (x[i] - 1.0) / self.tau);
        }
        Ok(())
    }
    fn evaluate_jacobian(&self, ctx: &EvalContext<'_>, _x: &LocalVector, j: &mut TripletBuffer) -> Result<()> {
        let node = ctx.dofs.node(self.node)?;
        j.add(node.potential(), node.potential(), 1.0);
        for s in [slot::ELECTRON, slot::HOLE] {
            let i = node.index(s);
            j.add(i, i, 1.0 / self.tau);
        }
        Ok(())
    }
    fn evaluate_time_residual(&self, ctx: &EvalContext<'_>, x: &LocalVector, r: &mut VectorBuffer) -> Result<()> {
        let Some(ts) = ctx.time else {
            return Ok(());
        };
        let node = ctx.dofs.node(self.node)?;
        let poison = matches!(self.fail_after, Some(t) if ts.time > t) && !self.failed.swap(true, Ordering::SeqCst);
        for s in [slot::ELECTRON, slot::HOLE] {
            let i = node.index(s);
            let d = if poison { f64::NAN } else { ts.derivative(i, x[i]) };
            r.add(i, d);
        }
        Ok(())
    }
    fn evaluate_time_jacobian(&self, ctx: &EvalContext<'_>, _x: &LocalVector, j: &mut TripletBuffer) -> Result<()> {
        let Some(ts) = ctx.time else {
            return Ok(());
        };
        let node = ctx.dofs.node(self.node)?;
        for s in [slot::ELECTRON, slot::HOLE] {
            let i = node.index(s);
            j.add(i, i, ts.derivative_coefficient());
        }
        Ok(())
    }
    fn update_solution(&mut self, dofs: &DofMap, x: &LocalVector) {
        let node = dofs.node(self.node).unwrap();
        for s in 0..3 {
            self.state[s] = x[node.index(s)];
        }
    }
}

/// Ohmic contact region: the device current out of the electrode node is g·ψ.
pub struct Contact {
    pub node: NodeId,
    pub conductance: f64,
    pub psi: f64,
    nodes: Vec<NodeId>,
}

impl Contact {
    pub fn new(node: NodeId, conductance: f64) -> Self {
        Self { node, conductance, psi: 0.0, nodes: vec![node] }
    }
}

impl Region for Contact {
    fn name(&self) -> &str {
        "contact"
    }
    fn role(&self) -> RegionRole {
        RegionRole::Electrode
    }
    fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }
    fn fill_initial_value(&self, dofs: &DofMap, x: &mut DistributedVector, _scaling: &mut DistributedVector) {
        x.set(dofs.flat_index(self.node, slot::POTENTIAL).unwrap(), self.psi);
    }
    fn evaluate_residual(&self, ctx: &EvalContext<'_>, x: &LocalVector, r: &mut VectorBuffer) -> Result<()> {
        let i = ctx.dofs.flat_index(self.node, slot::POTENTIAL)?;
        r.add(i, self.conductance * x[i]);
        Ok(())
    }
    fn evaluate_jacobian(&self, ctx: &EvalContext<'_>, _x: &LocalVector, j: &mut TripletBuffer) -> Result<()> {
        let i = ctx.dofs.flat_index(self.node, slot::POTENTIAL)?;
        j.add(i, i, self.conductance);
        Ok(())
    }
    fn update_solution(&mut self, dofs: &DofMap, x: &LocalVector) {
        self.psi = x[dofs.flat_index(self.node, slot::POTENTIAL).unwrap()];
    }
}

/// Electrode whose potential is the circuit node `circuit_row`.
///
/// The device current assembled in the electrode row is moved into the circuit row,
/// and the freed row carries ψ − v_c = 0.
pub struct CircuitElectrode {
    pub node: NodeId,
    pub circuit_row: usize,
    pub pre_process_calls: usize,
}

impl CircuitElectrode {
    pub fn new(node: NodeId, circuit_row: usize) -> Self {
        Self { node, circuit_row, pre_process_calls: 0 }
    }
}

impl BoundaryCondition for CircuitElectrode {
    fn name(&self) -> &str {
        "anode"
    }
    fn is_electrode(&self) -> bool {
        true
    }
    fn coupling(&self) -> Coupling {
        Coupling::Circuit
    }
    fn pre_process(&mut self) {
        self.pre_process_calls += 1;
    }
    fn preprocess(&self, ctx: &EvalContext<'_>, _x: &LocalVector, requests: &mut RowRequests) -> Result<()> {
        let e = ctx.dofs.flat_index(self.node, slot::POTENTIAL)?;
        requests.move_row(e, self.circuit_row);
        Ok(())
    }
    fn reserve_jacobian(&self, ctx: &EvalContext<'_>, j: &mut TripletBuffer) {
        if let Ok(e) = ctx.dofs.flat_index(self.node, slot::POTENTIAL) {
            j.reserve(e, e);
            j.reserve(e, self.circuit_row);
        }
    }
    fn evaluate_residual(&self, ctx: &EvalContext<'_>, x: &LocalVector, r: &mut VectorBuffer) -> Result<()> {
        let e = ctx.dofs.flat_index(self.node, slot::POTENTIAL)?;
        r.add(e, x[e] - x[self.circuit_row]);
        Ok(())
    }
    fn evaluate_jacobian(&self, ctx: &EvalContext<'_>, _x: &LocalVector, j: &mut TripletBuffer) -> Result<()> {
        let e = ctx.dofs.flat_index(self.node, slot::POTENTIAL)?;
        j.add(e, e, 1.0);
        j.add(e, self.circuit_row, -1.0);
        Ok(())
    }
}

/// What the test circuit has been asked to do.
#[derive(Debug, Default)]
pub struct CircuitLog {
    pub saved: Vec<f64>,
    pub restores: usize,
    pub sweep_values: Vec<f64>,
}

/// Source `vs` behind resistor `r` feeding circuit node `row`: (v_c − vs)/R.
pub struct SourceResistor {
    pub row: usize,
    pub resistance: f64,
    pub vs: f64,
    /// Device conductance seen through the electrode, for the KCL norm.
    pub load: f64,
    /// Sources above this value always produce a non-finite stamp.
    pub fail_above: Option<f64>,
    /// The first solve at exactly this source value produces a non-finite stamp.
    pub fail_at: Option<f64>,
    tripped: AtomicBool,
    saved_vc: f64,
    pub log: Arc<Mutex<CircuitLog>>,
}

impl SourceResistor {
    pub fn new(row: usize, resistance: f64, load: f64, log: Arc<Mutex<CircuitLog>>) -> Self {
        Self {
            row,
            resistance,
            vs: 0.0,
            load,
            fail_above: None,
            fail_at: None,
            tripped: AtomicBool::new(false),
            saved_vc: 0.0,
            log,
        }
    }

    fn poisoned(&self) -> bool {
        if self.fail_above.is_some_and(|limit| self.vs > limit) {
            return true;
        }
        self.fail_at == Some(self.vs) && !self.tripped.swap(true, Ordering::SeqCst)
    }
}

impl CircuitEngine for SourceResistor {
    fn fill_initial_value(&self, _dofs: &DofMap, x: &mut DistributedVector, _scaling: &mut DistributedVector) {
        x.set(self.row, self.saved_vc);
    }
    fn stamp_residual(&self, _ctx: &EvalContext<'_>, x: &LocalVector, r: &mut VectorBuffer) -> Result<()> {
        let value = if self.poisoned() { f64::NAN } else { (x[self.row] - self.vs) / self.resistance };
        r.add(self.row, value);
        Ok(())
    }
    fn stamp_jacobian(&self, _ctx: &EvalContext<'_>, _x: &LocalVector, j: &mut TripletBuffer) -> Result<()> {
        j.add(self.row, self.row, 1.0 / self.resistance);
        Ok(())
    }
    fn residual_norm(&self, _dofs: &DofMap, x: &LocalVector) -> f64 {
        let vc = x[self.row];
        ((vc - self.vs) / self.resistance + self.load * vc).abs()
    }
    fn save_state(&mut self, _dofs: &DofMap, x: &LocalVector) {
        self.saved_vc = x[self.row];
        self.log.lock().unwrap().saved.push(self.saved_vc);
    }
    fn restore_state(&mut self) {
        self.log.lock().unwrap().restores += 1;
    }
    fn apply_sweep_value(&mut self, value: f64) {
        self.vs = value;
        self.log.lock().unwrap().sweep_values.push(value);
    }
}

/// Electrode node 0 plus one circuit unknown, on a single rank.
pub fn electrode_with_circuit() -> DofMap {
    let mut b = DofMap::builder(1);
    b.add_node(0, 0, RegionRole::Electrode, 0).circuit_unknowns(1, None);
    b.build().unwrap()
}

/// A single semiconductor node on a single rank.
pub fn single_semiconductor() -> DofMap {
    let mut b = DofMap::builder(1);
    b.add_node(0, 0, RegionRole::Semiconductor, 0);
    b.build().unwrap()
}

pub fn is_budget_exhausted(e: &MixError) -> bool {
    matches!(e, MixError::RetryBudgetExhausted { .. })
}

/// Shared-memory SPMD communicator: one thread per rank.
///
/// Every collective is `wait; publish; wait; read`. The leading wait keeps a fast rank
/// from overwriting its slot while a slower one still reads the previous result.
pub struct ThreadComm {
    rank: usize,
    size: usize,
    shared: Arc<Exchange>,
}

struct Exchange {
    barrier: Barrier,
    values: Mutex<Vec<Vec<f64>>>,
    indices: Mutex<Vec<Vec<usize>>>,
}

impl ThreadComm {
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let shared = Arc::new(Exchange {
            barrier: Barrier::new(size),
            values: Mutex::new(vec![Vec::new(); size]),
            indices: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size).map(|rank| ThreadComm { rank, size, shared: shared.clone() }).collect()
    }

    fn exchange_values(&self, mine: &[f64]) -> Vec<Vec<f64>> {
        self.shared.barrier.wait();
        self.shared.values.lock().unwrap()[self.rank] = mine.to_vec();
        self.shared.barrier.wait();
        self.shared.values.lock().unwrap().clone()
    }
}

impl Comm for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
    fn barrier(&self) {
        self.shared.barrier.wait();
    }
    fn all_reduce(&self, x: f64) -> f64 {
        self.exchange_values(&[x]).iter().map(|v| v[0]).sum()
    }
    fn all_reduce_max(&self, x: f64) -> f64 {
        self.exchange_values(&[x]).iter().map(|v| v[0]).fold(f64::NEG_INFINITY, f64::max)
    }
    fn all_reduce_sum_vec(&self, data: &mut [f64]) {
        let all = self.exchange_values(data);
        for (i, d) in data.iter_mut().enumerate() {
            *d = all.iter().map(|v| v[i]).sum();
        }
    }
    fn all_gather_indices(&self, local: &[usize]) -> Vec<usize> {
        self.shared.barrier.wait();
        self.shared.indices.lock().unwrap()[self.rank] = local.to_vec();
        self.shared.barrier.wait();
        self.shared.indices.lock().unwrap().concat()
    }
    fn broadcast(&self, value: f64, root: usize) -> f64 {
        self.exchange_values(&[value])[root][0]
    }
}

/// Run `body` once per rank on its own thread and collect the results in rank order.
pub fn on_ranks<T: Send>(size: usize, body: impl Fn(ThreadComm) -> T + Sync) -> Vec<T> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = ThreadComm::group(size)
            .into_iter()
            .map(|comm| scope.spawn(|| body(comm)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}
