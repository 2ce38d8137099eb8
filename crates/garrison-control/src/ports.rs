// Conflict-free port triples for new servers.
//
// A candidate has to clear two tiers: no ledger row of the agent may hold any
// of its ports, and nothing on the agent host may be bound to them. Callers
// hold the agent lock from seeding until the chosen triple is inserted.

use std::collections::{HashMap, HashSet};

use garrison_proto::messages::{CheckPorts, PortUnavailable};

use crate::client::AgentClient;
use crate::config::PortRanges;
use crate::error::{ConflictScope, ControlError, ControlResult};
use crate::ledger::{PortTriple, ServerRecord};

// Candidates probed per `ports.check` round trip.
const PROBE_WINDOW: usize = 16;

/// Host-side view of which ports are taken.
#[async_trait::async_trait]
pub trait HostProbe: Send + Sync {
    async fn unavailable(&self, ports: &[u16]) -> ControlResult<HashMap<u16, PortUnavailable>>;
}

#[async_trait::async_trait]
impl HostProbe for AgentClient {
    async fn unavailable(&self, ports: &[u16]) -> ControlResult<HashMap<u16, PortUnavailable>> {
        let reply = self
            .call(&CheckPorts {
                ports: ports.to_vec(),
            })
            .await?;
        Ok(reply
            .unavailable
            .into_iter()
            .map(|u| (u.port, u))
            .collect())
    }
}

pub struct PortAllocator {
    ranges: PortRanges,
    // port -> description of the row holding it
    occupied: HashMap<u16, String>,
}

impl PortAllocator {
    /// Seed from ledger rows. Pass soft-deleted rows too unless ports are
    /// released on delete.
    pub fn new(ranges: PortRanges, servers: &[ServerRecord]) -> Self {
        let mut occupied = HashMap::new();
        for s in servers {
            for p in s.ports.ports() {
                occupied.insert(p, format!("{} ({})", s.name, s.id));
            }
        }
        Self { ranges, occupied }
    }

    pub fn is_occupied(&self, port: u16) -> bool {
        self.occupied.contains_key(&port)
    }

    fn reserve(&mut self, triple: PortTriple, owner: &str) {
        for p in triple.ports() {
            self.occupied.insert(p, owner.to_string());
        }
    }

    fn candidates(&self) -> impl Iterator<Item = PortTriple> + '_ {
        let game = self.ranges.game.clone().step_by(2);
        let rcon = self.ranges.rcon.clone();
        game.zip(rcon)
            .filter_map(|(g, r)| Some(PortTriple::new(g, g.checked_add(1)?, r)))
    }

    /// Allocate `count` triples, each clear in the ledger and on the host.
    pub async fn allocate(
        &mut self,
        count: usize,
        probe: &dyn HostProbe,
    ) -> ControlResult<Vec<PortTriple>> {
        let mut out = Vec::with_capacity(count);
        if count == 0 {
            return Ok(out);
        }

        let mut candidates: Vec<PortTriple> = self.candidates().collect();
        candidates.reverse();

        while out.len() < count {
            let mut window = Vec::with_capacity(PROBE_WINDOW);
            while window.len() < PROBE_WINDOW {
                let Some(c) = candidates.pop() else { break };
                if c.ports().iter().any(|p| self.is_occupied(*p)) {
                    continue;
                }
                window.push(c);
            }
            if window.is_empty() {
                tracing::warn!(count, found = out.len(), "port ranges exhausted");
                return Err(ControlError::NoPortsAvailable);
            }

            let ports: Vec<u16> = window.iter().flat_map(|t| t.ports()).collect();
            let busy = probe.unavailable(&ports).await?;

            for c in window {
                if out.len() == count {
                    break;
                }
                if c.ports().iter().any(|p| busy.contains_key(p)) {
                    tracing::debug!(game_port = c.game_port, "candidate bound on host");
                    continue;
                }
                self.reserve(c, "pending allocation");
                out.push(c);
            }
        }
        Ok(out)
    }

    /// Check a caller-supplied triple against both tiers.
    pub async fn validate(&mut self, triple: PortTriple, probe: &dyn HostProbe) -> ControlResult<()> {
        let ports = triple.ports();
        if ports.contains(&0) {
            return Err(ControlError::BadRequest("ports must be non-zero".into()));
        }
        if ports.iter().collect::<HashSet<_>>().len() != ports.len() {
            return Err(ControlError::BadRequest("ports must be distinct".into()));
        }

        for p in ports {
            if let Some(owner) = self.occupied.get(&p) {
                return Err(ControlError::PortConflict {
                    scope: ConflictScope::Ledger,
                    port: p,
                    owner: owner.clone(),
                });
            }
        }

        let busy = probe.unavailable(&ports).await?;
        for p in ports {
            if let Some(u) = busy.get(&p) {
                let owner = match (u.reason.is_empty(), u.source.is_empty()) {
                    (false, false) => format!("{} ({})", u.reason, u.source),
                    (false, true) => u.reason.clone(),
                    (true, false) => u.source.clone(),
                    (true, true) => "unknown".to_string(),
                };
                return Err(ControlError::PortConflict {
                    scope: ConflictScope::Host,
                    port: p,
                    owner,
                });
            }
        }

        self.reserve(triple, "pending allocation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::ledger::ServerStatus;

    /// Host with a fixed set of bound ports; counts probes.
    #[derive(Default)]
    struct FakeHost {
        bound: HashSet<u16>,
        probes: Mutex<usize>,
    }

    impl FakeHost {
        fn bound(ports: &[u16]) -> Self {
            Self {
                bound: ports.iter().copied().collect(),
                probes: Mutex::new(0),
            }
        }

        fn probes(&self) -> usize {
            *self.probes.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl HostProbe for FakeHost {
        async fn unavailable(&self, ports: &[u16]) -> ControlResult<HashMap<u16, PortUnavailable>> {
            *self.probes.lock().unwrap() += 1;
            Ok(ports
                .iter()
                .filter(|p| self.bound.contains(p))
                .map(|p| {
                    (
                        *p,
                        PortUnavailable {
                            port: *p,
                            reason: "in use".into(),
                            source: "sshd".into(),
                        },
                    )
                })
                .collect())
        }
    }

    fn ranges(game: (u16, u16), rcon: (u16, u16)) -> PortRanges {
        PortRanges::new(game.0..=game.1, rcon.0..=rcon.1).unwrap()
    }

    fn server(name: &str, ports: PortTriple, deleted: bool) -> ServerRecord {
        let now = Utc::now();
        ServerRecord {
            id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            name: name.to_string(),
            container_id: None,
            config: BTreeMap::new(),
            image_tag: "img".into(),
            ports,
            status: if deleted {
                ServerStatus::Deleted
            } else {
                ServerStatus::Running
            },
            data_exists: true,
            intent: None,
            intent_at: None,
            deleted_at: deleted.then_some(now),
            created_at: now,
            updated_at: now,
        }
    }

    fn assert_disjoint(triples: &[PortTriple], seeded: &[ServerRecord]) {
        let mut seen = HashSet::new();
        for p in seeded.iter().flat_map(|s| s.ports.ports()) {
            seen.insert(p);
        }
        for t in triples {
            assert_eq!(t.udp_port, t.game_port + 1);
            for p in t.ports() {
                assert!(seen.insert(p), "port {p} handed out twice");
            }
        }
    }

    #[tokio::test]
    async fn first_free_triple_is_range_start() {
        let mut alloc = PortAllocator::new(ranges((27015, 27515), (28015, 28515)), &[]);
        let got = alloc.allocate(1, &FakeHost::default()).await.unwrap();
        assert_eq!(got, vec![PortTriple::new(27015, 27016, 28015)]);
    }

    #[tokio::test]
    async fn skips_ledger_ports_including_soft_deleted() {
        let seeded = vec![
            server("alpha", PortTriple::new(27015, 27016, 28015), false),
            server("gone", PortTriple::new(27017, 27018, 28016), true),
        ];
        let mut alloc = PortAllocator::new(ranges((27015, 27515), (28015, 28515)), &seeded);
        let got = alloc.allocate(3, &FakeHost::default()).await.unwrap();
        assert_eq!(got[0], PortTriple::new(27019, 27020, 28017));
        assert_disjoint(&got, &seeded);
    }

    #[tokio::test]
    async fn skips_host_bound_ports() {
        // udp of the first candidate and rcon of the second are bound
        let host = FakeHost::bound(&[27016, 28016]);
        let mut alloc = PortAllocator::new(ranges((27015, 27515), (28015, 28515)), &[]);
        let got = alloc.allocate(2, &host).await.unwrap();
        assert_eq!(
            got,
            vec![
                PortTriple::new(27019, 27020, 28017),
                PortTriple::new(27021, 27022, 28018),
            ]
        );
        for t in &got {
            for p in t.ports() {
                assert!(!host.bound.contains(&p));
            }
        }
        assert_eq!(host.probes(), 1);
    }

    #[tokio::test]
    async fn consecutive_allocations_never_overlap() {
        let seeded = vec![server("alpha", PortTriple::new(27021, 27022, 28030), false)];
        let mut alloc = PortAllocator::new(ranges((27015, 27215), (28015, 28215)), &seeded);
        let host = FakeHost::bound(&[27033, 28040]);
        let mut all = Vec::new();
        for n in [1, 4, 2, 7] {
            all.extend(alloc.allocate(n, &host).await.unwrap());
        }
        assert_eq!(all.len(), 14);
        assert_disjoint(&all, &seeded);
    }

    #[tokio::test]
    async fn exhaustion_reports_no_ports() {
        let mut alloc = PortAllocator::new(ranges((100, 103), (200, 205)), &[]);
        // two game slots: 100 and 102
        assert_eq!(alloc.allocate(2, &FakeHost::default()).await.unwrap().len(), 2);
        assert!(matches!(
            alloc.allocate(1, &FakeHost::default()).await,
            Err(ControlError::NoPortsAvailable)
        ));
    }

    #[tokio::test]
    async fn explicit_triple_conflicts_name_the_tier() {
        let seeded = vec![server("alpha", PortTriple::new(27015, 27016, 28015), true)];
        let mut alloc = PortAllocator::new(ranges((27015, 27515), (28015, 28515)), &seeded);
        let host = FakeHost::bound(&[28100]);

        match alloc
            .validate(PortTriple::new(27100, 27016, 28099), &host)
            .await
        {
            Err(ControlError::PortConflict { scope, port, owner }) => {
                assert_eq!(scope, ConflictScope::Ledger);
                assert_eq!(port, 27016);
                assert!(owner.starts_with("alpha"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        match alloc
            .validate(PortTriple::new(27100, 27101, 28100), &host)
            .await
        {
            Err(ControlError::PortConflict { scope, port, owner }) => {
                assert_eq!(scope, ConflictScope::Host);
                assert_eq!(port, 28100);
                assert_eq!(owner, "in use (sshd)");
            }
            other => panic!("unexpected: {other:?}"),
        }

        alloc
            .validate(PortTriple::new(27100, 27101, 28101), &host)
            .await
            .unwrap();
        assert!(alloc.is_occupied(27101));
    }

    #[tokio::test]
    async fn explicit_triple_must_be_distinct_and_nonzero() {
        let mut alloc = PortAllocator::new(PortRanges::default(), &[]);
        let host = FakeHost::default();
        assert!(matches!(
            alloc.validate(PortTriple::new(0, 1, 2), &host).await,
            Err(ControlError::BadRequest(_))
        ));
        assert!(matches!(
            alloc.validate(PortTriple::new(5, 5, 6), &host).await,
            Err(ControlError::BadRequest(_))
        ));
        assert_eq!(host.probes(), 0);
    }
}
