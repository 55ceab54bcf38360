//! 贪吃蛇游戏状态
//!
//! 状态以 JSON 字符串保存在 `snake:state`，由移动和场景两类任务读改写。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use taskmesh_core::{
    keys, CoordinationStore, Direction, ScenarioAction, SchedulerError, SchedulerResult,
    TaskEnvelope, TaskKind,
};

use crate::executors::TaskHandler;

pub const BOARD_WIDTH: i32 = 20;
pub const BOARD_HEIGHT: i32 = 20;

pub type Position = [i32; 2];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub snake: Vec<Position>,
    pub food: Option<Position>,
    #[serde(default)]
    pub score: u32,
    #[serde(default)]
    pub game_over: bool,
    #[serde(default)]
    pub obstacles: Vec<Position>,
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            snake: vec![[5, 5], [5, 4], [5, 3]],
            food: Some([10, 10]),
            score: 0,
            game_over: false,
            obstacles: Vec::new(),
        }
    }
}

impl GameState {
    /// 读取当前状态，不存在时返回初始状态
    pub async fn load(store: &dyn CoordinationStore) -> SchedulerResult<Self> {
        match store.get(keys::SNAKE_STATE).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| SchedulerError::Serialization(format!("无效的游戏状态: {e}"))),
            None => Ok(Self::default()),
        }
    }

    pub async fn save(&self, store: &dyn CoordinationStore) -> SchedulerResult<()> {
        store
            .set(keys::SNAKE_STATE, &serde_json::to_string(self)?)
            .await
    }

    pub fn head(&self) -> Option<Position> {
        self.snake.first().copied()
    }

    /// 蛇头前进一步，吃到食物时增长并得分
    ///
    /// 返回是否吃到食物。吃到后食物被清空，等待场景任务放置新的食物。
    pub fn step(&mut self, direction: Direction) -> bool {
        let Some([x, y]) = self.head() else {
            return false;
        };
        let head = match direction {
            Direction::Up => [x, y - 1],
            Direction::Down => [x, y + 1],
            Direction::Left => [x - 1, y],
            Direction::Right => [x + 1, y],
        };
        self.snake.insert(0, head);

        if self.food == Some(head) {
            self.score += 1;
            self.food = None;
            true
        } else {
            self.snake.pop();
            false
        }
    }

    fn occupied(&self) -> Vec<Position> {
        let mut cells = self.snake.clone();
        cells.extend(self.obstacles.iter().copied());
        cells.extend(self.food);
        cells
    }

    /// 在棋盘上随机找一个空位置，棋盘已满时返回 None
    pub fn random_free_position<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Position> {
        let occupied: HashSet<Position> = self.occupied().into_iter().collect();
        let free: Vec<Position> = (0..BOARD_WIDTH)
            .flat_map(|x| (0..BOARD_HEIGHT).map(move |y| [x, y]))
            .filter(|cell| !occupied.contains(cell))
            .collect();
        free.choose(rng).copied()
    }

    pub fn add_food<R: Rng + ?Sized>(
        &mut self,
        position: Option<Position>,
        rng: &mut R,
    ) -> SchedulerResult<Position> {
        let position = self.resolve(position, rng)?;
        self.food = Some(position);
        Ok(position)
    }

    pub fn add_obstacle<R: Rng + ?Sized>(
        &mut self,
        position: Option<Position>,
        rng: &mut R,
    ) -> SchedulerResult<Position> {
        let position = self.resolve(position, rng)?;
        self.obstacles.push(position);
        Ok(position)
    }

    fn resolve<R: Rng + ?Sized>(
        &self,
        position: Option<Position>,
        rng: &mut R,
    ) -> SchedulerResult<Position> {
        match position {
            Some(position) => Ok(position),
            None => self
                .random_free_position(rng)
                .ok_or_else(|| SchedulerError::task_execution("棋盘上没有空位置")),
        }
    }
}

/// 处理 `snake_move` 任务
pub struct SnakeMoveHandler {
    store: Arc<dyn CoordinationStore>,
}

impl SnakeMoveHandler {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// 吃到食物后追加一个放置食物的场景任务
    async fn request_food(&self) -> SchedulerResult<u64> {
        let index = self.store.incr(keys::TASK_COUNTER).await?.max(0) as u64;
        let task = TaskEnvelope::new(
            index,
            TaskKind::ScenarioUpdate {
                action: ScenarioAction::AddFood,
                position: None,
            },
        );
        self.store
            .rpush(keys::UNASSIGNED_TASKS, &task.encode()?)
            .await?;
        Ok(index)
    }
}

#[async_trait]
impl TaskHandler for SnakeMoveHandler {
    fn kind(&self) -> &'static str {
        "snake_move"
    }

    async fn execute(&self, task: &TaskEnvelope) -> SchedulerResult<Value> {
        let TaskKind::SnakeMove {
            player_id,
            direction,
        } = &task.kind
        else {
            return Err(SchedulerError::task_execution(format!(
                "{} 不是移动任务",
                task.kind.name()
            )));
        };

        let mut state = GameState::load(self.store.as_ref()).await?;
        let ate = state.step(*direction);
        state.save(self.store.as_ref()).await?;

        if ate {
            let follow_up = self.request_food().await?;
            info!("吃到食物，得分 {}，已追加场景任务 {}", state.score, follow_up);
        } else {
            debug!("玩家 {:?} 向 {:?} 移动", player_id, direction);
        }

        Ok(json!({
            "player_id": player_id,
            "head": state.head(),
            "length": state.snake.len(),
            "score": state.score,
            "ate": ate,
        }))
    }
}

/// 处理 `scenario_update` 任务
pub struct ScenarioHandler {
    store: Arc<dyn CoordinationStore>,
}

impl ScenarioHandler {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for ScenarioHandler {
    fn kind(&self) -> &'static str {
        "scenario_update"
    }

    async fn execute(&self, task: &TaskEnvelope) -> SchedulerResult<Value> {
        let TaskKind::ScenarioUpdate { action, position } = &task.kind else {
            return Err(SchedulerError::task_execution(format!(
                "{} 不是场景任务",
                task.kind.name()
            )));
        };

        let mut state = GameState::load(self.store.as_ref()).await?;
        let placed = {
            let mut rng = rand::rng();
            match action {
                ScenarioAction::AddFood => state.add_food(*position, &mut rng)?,
                ScenarioAction::AddObstacle => state.add_obstacle(*position, &mut rng)?,
            }
        };
        state.save(self.store.as_ref()).await?;
        info!("场景更新 {:?}: {:?}", action, placed);

        Ok(json!({
            "action": action,
            "position": placed,
            "obstacles": state.obstacles.len(),
        }))
    }
}
