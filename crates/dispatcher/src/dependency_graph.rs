use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use coordinator_domain::models::Task;

/// 依赖图节点
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub task_id: String,
    /// 该任务声明的依赖（可能包含尚未注册的任务）
    pub dependencies: HashSet<String>,
    /// 反向边：依赖该任务的任务
    pub dependents: HashSet<String>,
}

/// 任务依赖图
///
/// 维护依赖/被依赖双向边与完成/失败集合，回答就绪判定。
/// 不变量：A 的 dependents 包含 B 当且仅当 B 的 dependencies 包含 A
/// （双方节点都在图中时）。
///
/// 图本身只做检测与查询，不做拒绝：插入形成环时由调度器查询
/// `detect_cycles` 后拒绝该任务。
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, DependencyNode>,
    completed: HashSet<String>,
    failed: HashSet<String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入任务节点并与图中已有的依赖/被依赖任务连边
    pub fn add_task(&mut self, task: &Task) {
        let dependencies: HashSet<String> = task.dependencies.iter().cloned().collect();

        // 正向边：依赖已在图中的，补上反向边
        for dep_id in &dependencies {
            if let Some(dep_node) = self.nodes.get_mut(dep_id) {
                dep_node.dependents.insert(task.id.clone());
            }
        }

        // 图中已有节点先声明了对本任务的依赖
        let dependents: HashSet<String> = self
            .nodes
            .values()
            .filter(|node| node.dependencies.contains(&task.id))
            .map(|node| node.task_id.clone())
            .collect();

        self.nodes.insert(
            task.id.clone(),
            DependencyNode {
                task_id: task.id.clone(),
                dependencies,
                dependents,
            },
        );
    }

    /// 删除节点并清理指向它的悬挂边。
    ///
    /// 调用方须先完成级联处理（完成解锁或失败级联取消）再移除节点。
    pub fn remove_task(&mut self, task_id: &str) {
        let Some(node) = self.nodes.remove(task_id) else {
            return;
        };
        for dep_id in &node.dependencies {
            if let Some(dep_node) = self.nodes.get_mut(dep_id) {
                dep_node.dependents.remove(task_id);
            }
        }
        for dependent_id in &node.dependents {
            if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                dependent.dependencies.remove(task_id);
            }
        }
        self.completed.remove(task_id);
        self.failed.remove(task_id);
    }

    /// 标记任务完成，返回因此变为就绪的依赖者列表。
    /// 重复标记是空操作，不会二次解锁。
    pub fn mark_completed(&mut self, task_id: &str) -> Vec<String> {
        if !self.completed.insert(task_id.to_string()) {
            debug!(task_id, "任务已标记完成，忽略重复标记");
            return Vec::new();
        }

        let Some(node) = self.nodes.get(task_id) else {
            return Vec::new();
        };

        let mut newly_ready: Vec<String> = node
            .dependents
            .iter()
            .filter(|dependent| self.is_task_ready(dependent))
            .cloned()
            .collect();
        newly_ready.sort();
        newly_ready
    }

    /// 标记任务失败，返回必须级联取消的依赖者传递闭包。
    /// 祖先失败的任务永远不会就绪，失败在这里不做静默重试。
    pub fn mark_failed(&mut self, task_id: &str) -> Vec<String> {
        if !self.failed.insert(task_id.to_string()) {
            return Vec::new();
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut cascade = Vec::new();

        if let Some(node) = self.nodes.get(task_id) {
            for dependent in &node.dependents {
                if visited.insert(dependent.clone()) {
                    queue.push_back(dependent.clone());
                }
            }
        }

        while let Some(current) = queue.pop_front() {
            cascade.push(current.clone());
            if let Some(node) = self.nodes.get(&current) {
                for dependent in &node.dependents {
                    if visited.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }

        if !cascade.is_empty() {
            warn!(
                task_id,
                count = cascade.len(),
                "任务失败，级联取消其依赖者"
            );
        }
        cascade.sort();
        cascade
    }

    /// 任务就绪：其声明的全部依赖都已完成
    pub fn is_task_ready(&self, task_id: &str) -> bool {
        match self.nodes.get(task_id) {
            Some(node) => node
                .dependencies
                .iter()
                .all(|dep| self.completed.contains(dep)),
            None => false,
        }
    }

    /// 所有就绪且未进入完成/失败集合的任务，按 ID 排序
    pub fn get_ready_tasks(&self) -> Vec<String> {
        let mut ready: Vec<String> = self
            .nodes
            .keys()
            .filter(|id| {
                !self.completed.contains(*id)
                    && !self.failed.contains(*id)
                    && self.is_task_ready(id)
            })
            .cloned()
            .collect();
        ready.sort();
        ready
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed.contains(task_id)
    }

    pub fn is_failed(&self, task_id: &str) -> bool {
        self.failed.contains(task_id)
    }

    pub fn get_node(&self, task_id: &str) -> Option<&DependencyNode> {
        self.nodes.get(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.nodes.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// DFS 检测依赖环，每个环返回一条有序的任务 ID 列表。
    /// 无环时返回空列表。
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: HashMap<&str, Color> = self
            .nodes
            .keys()
            .map(|id| (id.as_str(), Color::White))
            .collect();
        let mut cycles = Vec::new();

        let mut roots: Vec<&String> = self.nodes.keys().collect();
        roots.sort();

        for root in roots {
            if colors[root.as_str()] != Color::White {
                continue;
            }
            // 显式栈的迭代 DFS，沿依赖边走
            let mut path: Vec<&str> = Vec::new();
            let mut stack: Vec<(&str, bool)> = vec![(root.as_str(), false)];

            while let Some((current, children_done)) = stack.pop() {
                if children_done {
                    colors.insert(current, Color::Black);
                    path.pop();
                    continue;
                }
                if colors[current] != Color::White {
                    continue;
                }
                colors.insert(current, Color::Gray);
                path.push(current);
                stack.push((current, true));

                let Some(node) = self.nodes.get(current) else {
                    continue;
                };
                let mut deps: Vec<&String> = node
                    .dependencies
                    .iter()
                    .filter(|dep| self.nodes.contains_key(*dep))
                    .collect();
                deps.sort();
                for dep in deps {
                    match colors[dep.as_str()] {
                        Color::White => stack.push((dep.as_str(), false)),
                        Color::Gray => {
                            // 回边：从路径中截取环
                            if let Some(start) = path.iter().position(|id| *id == dep.as_str()) {
                                cycles.push(
                                    path[start..].iter().map(|id| id.to_string()).collect(),
                                );
                            }
                        }
                        Color::Black => {}
                    }
                }
            }
        }

        cycles
    }

    /// Kahn 拓扑排序，存在环时返回 None
    pub fn topological_sort(&self) -> Option<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for (id, node) in &self.nodes {
            let degree = node
                .dependencies
                .iter()
                .filter(|dep| self.nodes.contains_key(*dep))
                .count();
            in_degree.insert(id.as_str(), degree);
        }

        let mut queue: VecDeque<&str> = {
            let mut seeds: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(id, _)| *id)
                .collect();
            seeds.sort();
            seeds.into_iter().collect()
        };

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(current) = queue.pop_front() {
            order.push(current.to_string());
            let Some(node) = self.nodes.get(current) else {
                continue;
            };
            let mut unblocked: Vec<&str> = Vec::new();
            for dependent in &node.dependents {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        unblocked.push(dependent.as_str());
                    }
                }
            }
            unblocked.sort();
            for id in unblocked {
                queue.push_back(id);
            }
        }

        if order.len() < self.nodes.len() {
            None
        } else {
            Some(order)
        }
    }

    /// 关键路径：DAG 中按边数最长的路径，用于调度可视化。
    /// 存在环时返回空列表。
    pub fn find_critical_path(&self) -> Vec<String> {
        let Some(order) = self.topological_sort() else {
            return Vec::new();
        };

        let mut length: HashMap<&str, usize> = HashMap::new();
        let mut predecessor: HashMap<&str, &str> = HashMap::new();

        for id in &order {
            let node = &self.nodes[id];
            let mut best = 0usize;
            let mut best_dep: Option<&str> = None;
            let mut deps: Vec<&String> = node
                .dependencies
                .iter()
                .filter(|dep| self.nodes.contains_key(*dep))
                .collect();
            deps.sort();
            for dep in deps {
                let candidate = length.get(dep.as_str()).copied().unwrap_or(0) + 1;
                if candidate > best {
                    best = candidate;
                    best_dep = Some(dep.as_str());
                }
            }
            let id_ref = self.nodes[id].task_id.as_str();
            length.insert(id_ref, best);
            if let Some(dep) = best_dep {
                predecessor.insert(id_ref, dep);
            }
        }

        let Some((mut current, _)) = length
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(id, len)| (*id, *len))
        else {
            return Vec::new();
        };

        let mut path = vec![current.to_string()];
        while let Some(prev) = predecessor.get(current).copied() {
            path.push(prev.to_string());
            current = prev;
        }
        path.reverse();
        path
    }
}
