//! Topology template.
//!
//! Expands the `topology` options into the resource specs of one
//! cluster / task / service / load balancer stack. Architecture, image
//! source, autoscaling and exec support are toggles on the same topology,
//! and ids stay the same whichever toggles are set, so flipping a toggle
//! plans as creates, deletes or in-place changes instead of a new stack.

use serde_json::{json, Value};

use crate::resource::{ResourceKind, ResourceSpec};

use super::spec::{ProjectConfig, TopologyConfig};

/// Id of the cluster resource.
pub const CLUSTER_ID: &str = "cluster";
/// Id of the task definition resource.
pub const TASK_ID: &str = "task";
/// Id of the container resource.
pub const CONTAINER_ID: &str = "container";
/// Id of the first ingress rule.
pub const INGRESS_ID: &str = "http-ingress";
/// Id of the service resource.
pub const SERVICE_ID: &str = "service";
/// Id of the load balancer resource.
pub const LOAD_BALANCER_ID: &str = "load-balancer";
/// Id of the listener resource.
pub const LISTENER_ID: &str = "listener";
/// Id of the scaling policy resource.
pub const SCALING_ID: &str = "scaling";
/// Id of the exec permission statement.
pub const EXEC_PERMISSIONS_ID: &str = "exec-permissions";

/// Actions the task role needs for exec sessions.
pub const EXEC_ACTIONS: [&str; 4] = [
    "ssmmessages:CreateControlChannel",
    "ssmmessages:CreateDataChannel",
    "ssmmessages:OpenControlChannel",
    "ssmmessages:OpenDataChannel",
];

/// Builds resource specs from topology options.
#[derive(Debug)]
pub struct TopologyTemplate<'a> {
    topology: &'a TopologyConfig,
}

impl<'a> TopologyTemplate<'a> {
    /// Creates a template over `topology`.
    #[must_use]
    pub const fn new(topology: &'a TopologyConfig) -> Self {
        Self { topology }
    }

    /// Expands the topology into resource specs, dependencies first.
    #[must_use]
    pub fn build(&self, project: &ProjectConfig) -> Vec<ResourceSpec> {
        let mut specs = vec![self.cluster(project), self.task(project), self.container()];

        let ingress = self.ingress_rules();
        let mut service_deps: Vec<String> = ingress.iter().map(|r| r.id.clone()).collect();
        specs.extend(ingress);

        if self.topology.enable_exec_command {
            specs.push(Self::exec_permissions());
            service_deps.push(String::from(EXEC_PERMISSIONS_ID));
        }

        for (i, rule) in self.policy_rules().into_iter().enumerate() {
            service_deps.push(Self::policy_id(i));
            specs.push(rule);
        }

        specs.push(self.service(&service_deps));
        specs.push(self.load_balancer());
        specs.push(self.listener());

        if self.topology.enable_autoscaling {
            specs.push(self.scaling());
        }

        specs
    }

    fn cluster(&self, project: &ProjectConfig) -> ResourceSpec {
        let options = &self.topology.cluster;
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", project.name, project.environment));

        ResourceSpec::new(CLUSTER_ID, ResourceKind::Cluster)
            .with_attr("name", name)
            .with_attr("vpc", self.topology.vpc.as_str())
            .with_attr("container_insights", options.container_insights)
            .with_attr("capacity_providers", options.capacity_providers.clone())
    }

    fn task(&self, project: &ProjectConfig) -> ResourceSpec {
        let options = self.topology.task;

        ResourceSpec::new(TASK_ID, ResourceKind::TaskDefinition)
            .with_attr("family", format!("{}-{}", project.name, self.topology.container.name))
            .with_attr("cpu", options.cpu)
            .with_attr("memory", options.memory_mib)
            .with_attr("architecture", self.topology.architecture.provider_name())
            .with_attr("operating_system", "LINUX")
            .with_attr("network_mode", "awsvpc")
    }

    fn container(&self) -> ResourceSpec {
        let options = &self.topology.container;
        let port_mappings = json!([{
            "container_port": options.port,
            "host_port": options.host_port.unwrap_or(options.port),
        }]);
        let logging = json!({
            "driver": "awslogs",
            "stream_prefix": options.log_stream_prefix,
        });

        let mut spec = ResourceSpec::new(CONTAINER_ID, ResourceKind::Container)
            .with_attr("name", options.name.as_str())
            .with_attr("task_definition", TASK_ID)
            .with_attr("image", self.topology.image.reference())
            .with_attr("image_source", self.topology.image.source_name())
            .with_attr("cpu", options.cpu)
            .with_attr("memory", options.memory_mib)
            .with_attr("port_mappings", port_mappings)
            .with_attr("logging", logging)
            .depends_on(TASK_ID);

        if !options.command.is_empty() {
            spec.set_attr("command", options.command.clone());
        }
        if !options.environment.is_empty() {
            spec.set_attr("environment", json!(options.environment));
        }
        spec
    }

    fn ingress_rules(&self) -> Vec<ResourceSpec> {
        self.topology
            .ingress
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                let mut spec = ResourceSpec::new(Self::ingress_id(i), ResourceKind::SecurityRule)
                    .with_attr("rule_type", "ingress")
                    .with_attr("vpc", self.topology.vpc.as_str())
                    .with_attr("protocol", "tcp")
                    .with_attr("port", rule.port)
                    .with_attr("cidr", rule.cidr.as_str());
                if let Some(description) = &rule.description {
                    spec.set_attr("description", description.as_str());
                }
                spec
            })
            .collect()
    }

    fn ingress_id(index: usize) -> String {
        if index == 0 {
            String::from(INGRESS_ID)
        } else {
            format!("ingress-{}", index + 1)
        }
    }

    fn exec_permissions() -> ResourceSpec {
        ResourceSpec::new(EXEC_PERMISSIONS_ID, ResourceKind::SecurityRule)
            .with_attr("rule_type", "iam_policy")
            .with_attr("role", TASK_ID)
            .with_attr("actions", EXEC_ACTIONS.to_vec())
            .with_attr("resources", vec!["*"])
            .with_attr("description", "Exec session channels")
            .depends_on(TASK_ID)
    }

    fn policy_id(index: usize) -> String {
        format!("policy-{}", index + 1)
    }

    fn policy_rules(&self) -> Vec<ResourceSpec> {
        self.topology
            .policies
            .iter()
            .enumerate()
            .map(|(i, statement)| {
                let mut spec = ResourceSpec::new(Self::policy_id(i), ResourceKind::SecurityRule)
                    .with_attr("rule_type", "iam_policy")
                    .with_attr("role", TASK_ID)
                    .with_attr("actions", statement.actions.clone())
                    .with_attr("resources", statement.resources.clone())
                    .depends_on(TASK_ID);
                if let Some(description) = &statement.description {
                    spec.set_attr("description", description.as_str());
                }
                spec
            })
            .collect()
    }

    fn service(&self, extra_deps: &[String]) -> ResourceSpec {
        let options = &self.topology.service;
        let strategy: Vec<Value> = options
            .capacity_provider_strategy
            .iter()
            .map(|item| {
                json!({
                    "capacity_provider": item.capacity_provider,
                    "weight": item.weight,
                    "base": item.base,
                })
            })
            .collect();
        let security_groups: Vec<String> =
            (0..self.topology.ingress.len()).map(Self::ingress_id).collect();

        let mut spec = ResourceSpec::new(SERVICE_ID, ResourceKind::Service)
            .with_attr("cluster", CLUSTER_ID)
            .with_attr("task_definition", TASK_ID)
            .with_attr("launch_type", "FARGATE")
            .with_attr("desired_count", options.desired_count)
            .with_attr("assign_public_ip", options.assign_public_ip)
            .with_attr("capacity_provider_strategy", strategy)
            .with_attr(
                "circuit_breaker",
                json!({
                    "enable": options.circuit_breaker.enable,
                    "rollback": options.circuit_breaker.rollback,
                }),
            )
            .with_attr("security_groups", security_groups)
            .with_attr("enable_execute_command", self.topology.enable_exec_command)
            .depends_on(CLUSTER_ID)
            .depends_on(TASK_ID)
            .depends_on(CONTAINER_ID);

        if let Some(grace) = options.health_check_grace_period_secs {
            spec.set_attr("health_check_grace_period_secs", grace);
        }
        for dep in extra_deps {
            spec.depends_on.insert(dep.clone());
        }
        spec
    }

    fn load_balancer(&self) -> ResourceSpec {
        let options = self.topology.load_balancer;
        let mut spec = ResourceSpec::new(LOAD_BALANCER_ID, ResourceKind::LoadBalancer)
            .with_attr("internet_facing", options.internet_facing)
            .with_attr("vpc", self.topology.vpc.as_str())
            .with_attr("load_balancer_type", "application");
        if let Some(idle) = options.idle_timeout_secs {
            spec.set_attr("idle_timeout_secs", idle);
        }
        spec
    }

    fn listener(&self) -> ResourceSpec {
        let options = self.topology.load_balancer;
        ResourceSpec::new(LISTENER_ID, ResourceKind::Listener)
            .with_attr("load_balancer", LOAD_BALANCER_ID)
            .with_attr("port", options.listener_port)
            .with_attr("protocol", "HTTP")
            .with_attr("target_port", options.target_port)
            .with_attr("targets", vec![SERVICE_ID])
            .depends_on(LOAD_BALANCER_ID)
            .depends_on(SERVICE_ID)
    }

    fn scaling(&self) -> ResourceSpec {
        let options = self.topology.autoscaling;
        ResourceSpec::new(SCALING_ID, ResourceKind::ScalingPolicy)
            .with_attr("service", SERVICE_ID)
            .with_attr("min_capacity", options.min_capacity)
            .with_attr("max_capacity", options.max_capacity)
            .with_attr("metric", options.metric.provider_name())
            .with_attr("target_value", options.target_value)
            .with_attr("scale_in_cooldown_secs", options.scale_in_cooldown_secs)
            .with_attr("scale_out_cooldown_secs", options.scale_out_cooldown_secs)
            .depends_on(SERVICE_ID)
    }
}
