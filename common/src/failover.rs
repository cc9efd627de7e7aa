//! Coordinador de failover y stealing de jobs.
//!
//! Se invoca cada vez que un job falla o que la política de stealing lo
//! rechaza para que otro nodo se lo lleve. Decide a qué nodo va el job o si
//! se abandona para siempre. El estado (nodos fallidos, intentos, ladrón)
//! vive en el `JobContext` del job, que viaja con él.
//!
//! Distingue dos situaciones:
//! - fallo real del nodo: cuenta un intento y excluye el nodo de origen;
//! - stealing: el job va al nodo ladrón sin consumir intentos.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::FailoverConfig;
use crate::error::{ConfigError, FailoverError};
use crate::job::{JobContext, MAX_FAILOVER_ATTEMPTS_ATTR};
use crate::node::{LoadBalancer, Node, TopologyView};

/// Lo que el coordinador necesita saber del job que falló.
pub struct FailoverContext<'a> {
    pub task_id: &'a str,
    pub job_id: &'a str,
    /// Nodo donde estaba el job (donde falló o de donde se lo roban).
    pub origin: &'a Node,
    pub job_context: &'a mut JobContext,
    /// Topología viva del grid, para buscar al nodo ladrón.
    pub topology: &'a dyn TopologyView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverKind {
    /// Fallo real: consumió un intento.
    FailedOver,
    /// Stealing válido hacia el nodo ladrón.
    Stolen,
    /// Había ladrón pero no era parte de la topología de la tarea; el job se
    /// balanceó sin contar fallo ni robo.
    Rerouted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverDecision {
    pub node: Node,
    pub kind: FailoverKind,
}

/// Contadores expuestos en la interfaz de gestión.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverStats {
    pub max_failover_attempts: u32,
    pub total_failed_over_jobs: u64,
    pub total_stolen_jobs: u64,
}

pub struct FailoverCoordinator {
    config: FailoverConfig,
    balancer: Arc<dyn LoadBalancer>,
    total_failed_over: AtomicU64,
    total_stolen: AtomicU64,
}

impl FailoverCoordinator {
    pub fn new(config: FailoverConfig, balancer: Arc<dyn LoadBalancer>) -> Self {
        debug!(
            max_failover_attempts = config.max_failover_attempts(),
            "coordinador de failover iniciado"
        );
        Self {
            config,
            balancer,
            total_failed_over: AtomicU64::new(0),
            total_stolen: AtomicU64::new(0),
        }
    }

    pub fn max_failover_attempts(&self) -> u32 {
        self.config.max_failover_attempts()
    }

    pub fn total_failed_over_jobs(&self) -> u64 {
        self.total_failed_over.load(Ordering::Relaxed)
    }

    pub fn total_stolen_jobs(&self) -> u64 {
        self.total_stolen.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> FailoverStats {
        FailoverStats {
            max_failover_attempts: self.max_failover_attempts(),
            total_failed_over_jobs: self.total_failed_over_jobs(),
            total_stolen_jobs: self.total_stolen_jobs(),
        }
    }

    pub fn node_attributes(&self) -> BTreeMap<String, Value> {
        self.config.node_attributes()
    }

    /// Compara los atributos de otro nodo con los propios. Un nodo que no
    /// publica el atributo se acepta.
    pub fn check_consistency(&self, remote: &BTreeMap<String, Value>) -> Result<(), ConfigError> {
        let Some(remote_max) = remote.get(MAX_FAILOVER_ATTEMPTS_ATTR) else {
            return Ok(());
        };

        let local_max = Value::from(self.max_failover_attempts());
        if *remote_max != local_max {
            return Err(ConfigError::Inconsistent {
                name: MAX_FAILOVER_ATTEMPTS_ATTR.to_string(),
                local: local_max.to_string(),
                remote: remote_max.to_string(),
            });
        }
        Ok(())
    }

    /// Devuelve el nodo donde re-ejecutar el job, o `None` si el job queda
    /// fallido para siempre.
    pub fn failover(&self, ctx: FailoverContext<'_>, top: &[Node]) -> Option<Node> {
        self.decide(ctx, top).ok().map(|d| d.node)
    }

    /// Igual que [`failover`](Self::failover) pero con el motivo del abandono
    /// y el tipo de movimiento.
    pub fn decide(
        &self,
        ctx: FailoverContext<'_>,
        top: &[Node],
    ) -> Result<FailoverDecision, FailoverError> {
        let FailoverContext {
            task_id,
            job_id,
            origin,
            job_context,
            topology,
        } = ctx;
        let max = self.max_failover_attempts();

        if top.is_empty() {
            warn!(task_id, job_id, "topología vacía, el job no tiene dónde ir");
            return Err(FailoverError::no_viable("topología vacía"));
        }

        if let Some(seen) = job_context.max_failover_attempts {
            if seen != max {
                warn!(
                    task_id,
                    job_id,
                    local = max,
                    remote = seen,
                    "maximum_failover_attempts distinto entre nodos"
                );
            }
        }
        job_context.max_failover_attempts = Some(max);

        let attempts = job_context.failover_attempts;
        if attempts > max {
            error!(
                task_id,
                job_id,
                attempts,
                max,
                "el contador de failover superó el máximo de intentos"
            );
            return Err(FailoverError::ExhaustedRetries { attempts, max });
        }
        if attempts == max {
            warn!(
                task_id,
                job_id,
                max,
                "failover abandonado: se alcanzó el máximo de intentos"
            );
            return Err(FailoverError::ExhaustedRetries { attempts, max });
        }

        let mut is_node_failed = false;
        let mut thief: Option<Node> = None;

        match job_context.take_thief() {
            None => is_node_failed = true,
            Some(thief_id) => match topology.node(&thief_id) {
                Err(e) => {
                    error!(task_id, job_id, thief = %thief_id, "error buscando al nodo ladrón: {e:#}");
                    return Err(FailoverError::no_viable(format!(
                        "error consultando la topología: {e}"
                    )));
                }
                Ok(None) => {
                    is_node_failed = true;
                    warn!(
                        task_id,
                        job_id,
                        thief = %thief_id,
                        "el nodo ladrón salió del grid (failover por balanceo)"
                    );
                }
                Ok(Some(node)) if node.id == origin.id => {
                    is_node_failed = true;
                    error!(
                        task_id,
                        job_id,
                        thief = %node.id,
                        "el nodo ladrón es el mismo nodo del job (failover por balanceo)"
                    );
                }
                Ok(Some(node)) if !top.iter().any(|n| n.id == node.id) => {
                    warn!(
                        task_id,
                        job_id,
                        thief = %node.id,
                        top_size = top.len(),
                        "el nodo ladrón no es parte de la topología de la tarea (failover por balanceo)"
                    );
                }
                Ok(Some(node)) => {
                    debug!(task_id, job_id, from = %origin.id, to = %node.id, "robo de job válido");
                    thief = Some(node);
                }
            },
        }

        let decision = match thief {
            Some(node) => FailoverDecision {
                node,
                kind: FailoverKind::Stolen,
            },
            None => {
                if is_node_failed {
                    job_context.failed_nodes.insert(origin.id.clone());
                }

                let candidates: Vec<Node> = top
                    .iter()
                    .filter(|n| !job_context.has_failed_on(&n.id))
                    .cloned()
                    .collect();

                if candidates.is_empty() {
                    warn!(
                        task_id,
                        job_id,
                        failed_nodes = ?job_context.failed_nodes,
                        "la topología sólo tiene nodos donde el job ya falló"
                    );
                    return Err(FailoverError::no_viable(
                        "todos los nodos candidatos ya fallaron con este job",
                    ));
                }

                let node = match self.balancer.balanced_node(&candidates) {
                    Ok(Some(node)) => node,
                    Ok(None) => {
                        warn!(
                            task_id,
                            job_id,
                            candidates = candidates.len(),
                            "el balanceador no devolvió ningún nodo"
                        );
                        return Err(FailoverError::no_viable("el balanceador no devolvió nodo"));
                    }
                    Err(e) => {
                        error!(task_id, job_id, "error del balanceador durante el failover: {e:#}");
                        return Err(FailoverError::no_viable(format!("error del balanceador: {e}")));
                    }
                };

                FailoverDecision {
                    node,
                    kind: if is_node_failed {
                        FailoverKind::FailedOver
                    } else {
                        FailoverKind::Rerouted
                    },
                }
            }
        };

        // robar no consume intentos
        if is_node_failed {
            job_context.failover_attempts += 1;
        }

        self.total_failed_over.fetch_add(1, Ordering::Relaxed);

        match decision.kind {
            FailoverKind::FailedOver => warn!(
                task_id,
                job_id,
                from = %origin.id,
                to = %decision.node.id,
                attempt = job_context.failover_attempts,
                "failover de job a un nodo nuevo"
            ),
            FailoverKind::Stolen => {
                self.total_stolen.fetch_add(1, Ordering::Relaxed);
                info!(
                    task_id,
                    job_id,
                    from = %origin.id,
                    to = %decision.node.id,
                    "job robado por un nodo nuevo"
                );
            }
            FailoverKind::Rerouted => info!(
                task_id,
                job_id,
                from = %origin.id,
                to = %decision.node.id,
                "job re-balanceado sin contar fallo"
            ),
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use std::sync::Mutex;

    /// Balanceador de prueba: devuelve el primer candidato y guarda lo que vio.
    #[derive(Default)]
    struct FirstNode {
        seen: Mutex<Vec<Vec<NodeId>>>,
    }

    impl LoadBalancer for FirstNode {
        fn balanced_node(&self, candidates: &[Node]) -> anyhow::Result<Option<Node>> {
            self.seen
                .lock()
                .unwrap()
                .push(candidates.iter().map(|n| n.id.clone()).collect());
            Ok(candidates.first().cloned())
        }
    }

    struct NoNode;

    impl LoadBalancer for NoNode {
        fn balanced_node(&self, _candidates: &[Node]) -> anyhow::Result<Option<Node>> {
            Ok(None)
        }
    }

    struct BrokenBalancer;

    impl LoadBalancer for BrokenBalancer {
        fn balanced_node(&self, _candidates: &[Node]) -> anyhow::Result<Option<Node>> {
            anyhow::bail!("balanceador caído")
        }
    }

    struct BrokenTopology;

    impl TopologyView for BrokenTopology {
        fn node(&self, _id: &NodeId) -> anyhow::Result<Option<Node>> {
            anyhow::bail!("discovery caído")
        }
    }

    fn nodes(n: usize) -> Vec<Node> {
        (1..=n)
            .map(|i| Node::new(format!("n{i}"), format!("host{i}")))
            .collect()
    }

    fn coordinator(max: i64) -> (FailoverCoordinator, Arc<FirstNode>) {
        let balancer = Arc::new(FirstNode::default());
        let coord = FailoverCoordinator::new(FailoverConfig::new(max).unwrap(), balancer.clone());
        (coord, balancer)
    }

    fn run(
        coord: &FailoverCoordinator,
        origin: &Node,
        job_context: &mut JobContext,
        live: &Vec<Node>,
        top: &[Node],
    ) -> Result<FailoverDecision, FailoverError> {
        coord.decide(
            FailoverContext {
                task_id: "t1",
                job_id: "j1",
                origin,
                job_context,
                topology: live,
            },
            top,
        )
    }

    #[test]
    fn topologia_vacia_devuelve_none() {
        let (coord, _) = coordinator(5);
        let live = nodes(2);
        let mut ctx = JobContext::default();
        let res = coord.failover(
            FailoverContext {
                task_id: "t1",
                job_id: "j1",
                origin: &live[0],
                job_context: &mut ctx,
                topology: &live,
            },
            &[],
        );
        assert!(res.is_none());
        assert_eq!(coord.total_failed_over_jobs(), 0);
    }

    #[test]
    fn el_techo_de_intentos_es_inclusivo() {
        let max = 3;
        let live = nodes(3);

        for attempts in 0..=max + 2 {
            let (coord, _) = coordinator(max as i64);
            let mut ctx = JobContext {
                failover_attempts: attempts,
                ..Default::default()
            };
            let res = run(&coord, &live[0], &mut ctx, &live, &live);

            if attempts >= max {
                assert_eq!(
                    res,
                    Err(FailoverError::ExhaustedRetries { attempts, max }),
                    "attempts={attempts}"
                );
                assert_eq!(ctx.failover_attempts, attempts);
            } else {
                assert!(res.is_ok(), "attempts={attempts}");
            }
        }
    }

    #[test]
    fn fallo_real_excluye_el_nodo_y_cuenta_intento() {
        let (coord, balancer) = coordinator(5);
        let live = nodes(3);
        let mut ctx = JobContext::default();

        let decision = run(&coord, &live[0], &mut ctx, &live, &live).unwrap();

        assert_eq!(decision.node.id, "n2");
        assert_eq!(decision.kind, FailoverKind::FailedOver);
        assert_eq!(ctx.failover_attempts, 1);
        assert!(ctx.has_failed_on("n1"));
        assert_eq!(ctx.max_failover_attempts, Some(5));
        assert_eq!(balancer.seen.lock().unwrap()[0], vec!["n2", "n3"]);
        assert_eq!(coord.total_failed_over_jobs(), 1);
        assert_eq!(coord.total_stolen_jobs(), 0);
    }

    #[test]
    fn robo_valido_no_consume_intentos() {
        let (coord, balancer) = coordinator(5);
        let live = nodes(3);
        let mut ctx = JobContext::default();
        ctx.mark_thief("n3");

        let decision = run(&coord, &live[0], &mut ctx, &live, &live).unwrap();

        assert_eq!(decision.node.id, "n3");
        assert_eq!(decision.kind, FailoverKind::Stolen);
        assert_eq!(ctx.failover_attempts, 0);
        assert!(ctx.failed_nodes.is_empty());
        assert!(ctx.thief.is_none());
        assert!(balancer.seen.lock().unwrap().is_empty());
        assert_eq!(coord.total_failed_over_jobs(), 1);
        assert_eq!(coord.total_stolen_jobs(), 1);
    }

    #[test]
    fn robo_con_el_techo_alcanzado_tambien_se_abandona() {
        let (coord, _) = coordinator(1);
        let live = nodes(2);
        let mut ctx = JobContext {
            failover_attempts: 1,
            ..Default::default()
        };
        ctx.mark_thief("n2");

        let res = run(&coord, &live[0], &mut ctx, &live, &live);

        assert!(matches!(res, Err(FailoverError::ExhaustedRetries { .. })));
        // el ladrón no se consumió
        assert_eq!(ctx.thief.as_deref(), Some("n2"));
    }

    #[test]
    fn ladron_igual_al_origen_equivale_a_fallo() {
        let live = nodes(3);

        let (coord_a, _) = coordinator(5);
        let mut stolen_ctx = JobContext::default();
        stolen_ctx.mark_thief("n1");
        let a = run(&coord_a, &live[0], &mut stolen_ctx, &live, &live).unwrap();

        let (coord_b, _) = coordinator(5);
        let mut failed_ctx = JobContext::default();
        let b = run(&coord_b, &live[0], &mut failed_ctx, &live, &live).unwrap();

        assert_eq!(a, b);
        assert_eq!(stolen_ctx, failed_ctx);
        assert_eq!(coord_a.stats(), coord_b.stats());
        assert_eq!(coord_a.total_stolen_jobs(), 0);
    }

    #[test]
    fn ladron_fuera_de_la_topologia_de_la_tarea_no_cuenta_fallo_ni_robo() {
        let (coord, balancer) = coordinator(5);
        let live = nodes(4);
        // la tarea sólo corre en n1..n3, n4 está vivo pero fuera
        let top = &live[..3];
        let mut ctx = JobContext::default();
        ctx.mark_thief("n4");

        let decision = run(&coord, &live[0], &mut ctx, &live, top).unwrap();

        assert_eq!(decision.kind, FailoverKind::Rerouted);
        // n1 no se excluye porque no falló
        assert_eq!(decision.node.id, "n1");
        assert_eq!(balancer.seen.lock().unwrap()[0], vec!["n1", "n2", "n3"]);
        assert_eq!(ctx.failover_attempts, 0);
        assert!(ctx.failed_nodes.is_empty());
        assert!(ctx.thief.is_none());
        assert_eq!(coord.total_stolen_jobs(), 0);
    }

    #[test]
    fn robo_y_caida_del_ladron_marca_solo_el_origen() {
        // el job estaba en A (n1), B (n2) pidió robarlo y murió antes de recibirlo
        let (coord, balancer) = coordinator(5);
        let all = nodes(3);
        let live: Vec<Node> = vec![all[0].clone(), all[2].clone()];
        let mut ctx = JobContext::default();
        ctx.mark_thief("n2");

        let decision = run(&coord, &all[0], &mut ctx, &live, &live).unwrap();

        assert_eq!(decision.kind, FailoverKind::FailedOver);
        assert_eq!(decision.node.id, "n3");
        assert!(ctx.has_failed_on("n1"));
        assert!(!ctx.has_failed_on("n2"));
        assert_eq!(ctx.failover_attempts, 1);
        assert_eq!(balancer.seen.lock().unwrap()[0], vec!["n3"]);
        assert_eq!(coord.total_stolen_jobs(), 0);
    }

    #[test]
    fn lista_de_fallidos_nunca_incluye_nodos_robados() {
        let (coord, _) = coordinator(5);
        let live = nodes(4);
        let mut ctx = JobContext::default();

        // robado de n1 a n2, luego de n2 a n3
        ctx.mark_thief("n2");
        run(&coord, &live[0], &mut ctx, &live, &live).unwrap();
        ctx.mark_thief("n3");
        run(&coord, &live[1], &mut ctx, &live, &live).unwrap();
        // n3 falla de verdad
        let last = run(&coord, &live[2], &mut ctx, &live, &live).unwrap();

        assert_eq!(ctx.failed_nodes.iter().collect::<Vec<_>>(), vec!["n3"]);
        assert_eq!(ctx.failover_attempts, 1);
        assert_eq!(last.node.id, "n1");
        assert_eq!(coord.total_stolen_jobs(), 2);
        assert_eq!(coord.total_failed_over_jobs(), 3);
    }

    #[test]
    fn techo_de_cinco_abandona_al_sexto_fallo() {
        let (coord, _) = coordinator(5);
        let live = nodes(7);
        let mut ctx = JobContext::default();
        let mut current = live[0].clone();

        for _ in 0..5 {
            let decision = run(&coord, &current, &mut ctx, &live, &live).unwrap();
            assert_ne!(decision.node, current);
            current = decision.node;
        }

        let sixth = run(&coord, &current, &mut ctx, &live, &live);
        assert_eq!(
            sixth,
            Err(FailoverError::ExhaustedRetries {
                attempts: 5,
                max: 5
            })
        );
        assert_eq!(ctx.failed_nodes.len(), 5);
        assert_eq!(coord.total_failed_over_jobs(), 5);
    }

    #[test]
    fn sin_candidatos_tras_excluir_fallidos_devuelve_none() {
        let (coord, _) = coordinator(5);
        let live = nodes(2);
        let mut ctx = JobContext::default();
        ctx.failed_nodes.insert("n2".to_string());

        let res = run(&coord, &live[0], &mut ctx, &live, &live);

        assert!(matches!(res, Err(FailoverError::NoViableNode { .. })));
        // el origen igual quedó registrado como fallido
        assert!(ctx.has_failed_on("n1"));
        assert_eq!(ctx.failover_attempts, 0);
        assert_eq!(coord.total_failed_over_jobs(), 0);
    }

    #[test]
    fn balanceador_sin_nodo_abandona_sin_contar_intento() {
        let coord = FailoverCoordinator::new(FailoverConfig::default(), Arc::new(NoNode));
        let live = nodes(2);
        let mut ctx = JobContext::default();

        let res = run(&coord, &live[0], &mut ctx, &live, &live);

        assert!(matches!(res, Err(FailoverError::NoViableNode { .. })));
        assert_eq!(ctx.failover_attempts, 0);
        assert_eq!(coord.total_failed_over_jobs(), 0);
    }

    #[test]
    fn error_del_balanceador_se_convierte_en_none() {
        let coord = FailoverCoordinator::new(FailoverConfig::default(), Arc::new(BrokenBalancer));
        let live = nodes(2);
        let mut ctx = JobContext::default();

        let res = coord.failover(
            FailoverContext {
                task_id: "t1",
                job_id: "j1",
                origin: &live[0],
                job_context: &mut ctx,
                topology: &live,
            },
            &live,
        );
        assert!(res.is_none());
    }

    #[test]
    fn error_de_la_topologia_se_convierte_en_none() {
        let (coord, _) = coordinator(5);
        let live = nodes(2);
        let mut ctx = JobContext::default();
        ctx.mark_thief("n2");

        let res = coord.decide(
            FailoverContext {
                task_id: "t1",
                job_id: "j1",
                origin: &live[0],
                job_context: &mut ctx,
                topology: &BrokenTopology,
            },
            &live,
        );
        assert!(matches!(res, Err(FailoverError::NoViableNode { .. })));
        assert_eq!(coord.total_failed_over_jobs(), 0);
    }

    #[test]
    fn max_distinto_en_el_contexto_se_sobrescribe_con_el_local() {
        let (coord, _) = coordinator(5);
        let live = nodes(2);
        let mut ctx = JobContext {
            max_failover_attempts: Some(9),
            ..Default::default()
        };

        run(&coord, &live[0], &mut ctx, &live, &live).unwrap();

        assert_eq!(ctx.max_failover_attempts, Some(5));
    }

    #[test]
    fn consistencia_de_atributos_entre_nodos() {
        let (coord, _) = coordinator(5);
        assert!(coord.check_consistency(&coord.node_attributes()).is_ok());
        assert!(coord.check_consistency(&BTreeMap::new()).is_ok());

        let (other, _) = coordinator(3);
        let err = coord.check_consistency(&other.node_attributes()).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent { .. }));
    }

    #[test]
    fn stats_refleja_la_configuracion() {
        let (coord, _) = coordinator(2);
        assert_eq!(
            coord.stats(),
            FailoverStats {
                max_failover_attempts: 2,
                total_failed_over_jobs: 0,
                total_stolen_jobs: 0,
            }
        );
    }
}
