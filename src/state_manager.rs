// Trading DB
// SQLite persistence for tasks and orders
//
// An InOutOrder is stored as one `iorder` row plus up to two `exorder`
// rows (enter / exit leg). Only the dirty parts of an order are written.

use anyhow::Context;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::errors::{ErrKind, Result, TradeError};
use crate::orders::{ExOrder, InOutOrder, InOutStatus, OdStatus, OrderInfo};
use crate::types::{Dirt, OrderType, Side};

// =============================================================================
// Data Models
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    /// backtest / dry_run / prod
    pub mode: String,
    pub name: String,
    pub create_at: i64,
    pub start_at: i64,
    pub stop_at: i64,
    pub info: String,
}

/// Which orders [`SqliteStateManager::get_orders`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    /// Not fully exited
    Open,
    /// Fully exited
    His,
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    /// 0 matches every task
    pub task_id: i64,
    pub strategy: String,
    pub pairs: Vec<String>,
    pub timeframe: String,
    pub status: StatusFilter,
    pub dirt: Dirt,
    /// Entered at or after, 0 unbounded
    pub enter_after: i64,
    /// Entered before, 0 unbounded
    pub enter_before: i64,
    pub enter_tag: String,
    pub exit_tag: String,
    /// 0 means no limit
    pub limit: usize,
    pub offset: usize,
}

impl OrderFilter {
    pub fn task(task_id: i64) -> Self {
        Self {
            task_id,
            ..Default::default()
        }
    }
}

// =============================================================================
// State Manager Implementation
// =============================================================================

pub struct SqliteStateManager {
    conn: Arc<Mutex<Connection>>,
}

const IORDER_COLS: &str = "id, task_id, symbol, sid, timeframe, short, status, enter_tag, init_price, \
     quote_cost, exit_tag, leverage, enter_at, exit_at, strategy, stg_ver, max_pft_rate, \
     max_draw_down, profit_rate, profit, info";

const EXORDER_COLS: &str = "id, task_id, inout_id, symbol, enter, order_type, order_id, side, create_at, \
     price, average, amount, filled, status, fee, fee_type, update_at";

impl SqliteStateManager {
    pub fn new<P: AsRef<Path>>(db_path: P) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref();

        // Create parent directories
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let manager = Self::from_conn(conn)?;
        info!(path = %db_path.display(), "trading db opened");
        Ok(manager)
    }

    /// Private database, used by tests and throwaway runs
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        manager.create_tables().context("Failed to create trading tables")?;
        Ok(manager)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS task (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mode TEXT NOT NULL,
                name TEXT NOT NULL,
                create_at INTEGER NOT NULL,
                start_at INTEGER NOT NULL DEFAULT 0,
                stop_at INTEGER NOT NULL DEFAULT 0,
                info TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS iorder (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                sid INTEGER NOT NULL DEFAULT 0,
                timeframe TEXT NOT NULL,
                short INTEGER NOT NULL,
                status INTEGER NOT NULL,
                enter_tag TEXT NOT NULL,
                init_price REAL NOT NULL,
                quote_cost REAL NOT NULL,
                exit_tag TEXT NOT NULL DEFAULT '',
                leverage REAL NOT NULL DEFAULT 1,
                enter_at INTEGER NOT NULL,
                exit_at INTEGER NOT NULL DEFAULT 0,
                strategy TEXT NOT NULL,
                stg_ver INTEGER NOT NULL DEFAULT 0,
                max_pft_rate REAL NOT NULL DEFAULT 0,
                max_draw_down REAL NOT NULL DEFAULT 0,
                profit_rate REAL NOT NULL DEFAULT 0,
                profit REAL NOT NULL DEFAULT 0,
                info TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS exorder (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                inout_id INTEGER NOT NULL REFERENCES iorder(id) ON DELETE CASCADE,
                symbol TEXT NOT NULL,
                enter INTEGER NOT NULL,
                order_type TEXT NOT NULL,
                order_id TEXT NOT NULL DEFAULT '',
                side TEXT NOT NULL,
                create_at INTEGER NOT NULL,
                price REAL NOT NULL DEFAULT 0,
                average REAL NOT NULL DEFAULT 0,
                amount REAL NOT NULL DEFAULT 0,
                filled REAL NOT NULL DEFAULT 0,
                status INTEGER NOT NULL DEFAULT 0,
                fee REAL NOT NULL DEFAULT 0,
                fee_type TEXT NOT NULL DEFAULT '',
                update_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_iorder_task ON iorder(task_id, strategy);
            CREATE INDEX IF NOT EXISTS idx_iorder_status ON iorder(status);
            CREATE INDEX IF NOT EXISTS idx_exorder_inout ON exorder(inout_id);",
        )?;
        debug!("trading schema created/verified");
        Ok(())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    pub fn create_task(&self, mode: &str, name: &str, create_at: i64, start_at: i64) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO task (mode, name, create_at, start_at) VALUES (?1, ?2, ?3, ?4)",
            params![mode, name, create_at, start_at],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, mode, name, "task created");
        Ok(id)
    }

    pub fn finish_task(&self, task_id: i64, stop_at: i64, info: &str) -> Result<()> {
        let conn = self.lock();
        let num = conn.execute(
            "UPDATE task SET stop_at = ?1, info = ?2 WHERE id = ?3",
            params![stop_at, info, task_id],
        )?;
        if num == 0 {
            return Err(TradeError::new(ErrKind::DbReadFail, format!("task {} not found", task_id)));
        }
        Ok(())
    }

    pub fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>> {
        let conn = self.lock();
        let res = conn
            .query_row(
                "SELECT id, mode, name, create_at, start_at, stop_at, info FROM task WHERE id = ?1",
                params![task_id],
                |row| {
                    Ok(TaskRecord {
                        id: row.get(0)?,
                        mode: row.get(1)?,
                        name: row.get(2)?,
                        create_at: row.get(3)?,
                        start_at: row.get(4)?,
                        stop_at: row.get(5)?,
                        info: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(res)
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Write the dirty parts of an order. A new order gets its id here.
    pub fn save_order(&self, od: &mut InOutOrder) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let info = od.info_text()?;
        if od.id <= 0 {
            tx.execute(
                &format!(
                    "INSERT INTO iorder ({}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                    IORDER_COLS
                ),
                params![
                    od.task_id,
                    od.symbol,
                    od.sid,
                    od.timeframe,
                    od.short,
                    od.status as i64,
                    od.enter_tag,
                    od.init_price,
                    od.quote_cost,
                    od.exit_tag,
                    od.leverage,
                    od.enter_at,
                    od.exit_at,
                    od.strategy,
                    od.stg_ver,
                    od.max_pft_rate,
                    od.max_draw_down,
                    od.profit_rate,
                    od.profit,
                    info,
                ],
            )?;
            od.id = tx.last_insert_rowid();
            od.dirty_enter = true;
            od.dirty_exit = od.exit.is_some();
        } else if od.dirty_main || od.dirty_info {
            tx.execute(
                "UPDATE iorder SET status = ?1, init_price = ?2, quote_cost = ?3, exit_tag = ?4, leverage = ?5,
                    enter_at = ?6, exit_at = ?7, max_pft_rate = ?8, max_draw_down = ?9, profit_rate = ?10,
                    profit = ?11, info = ?12 WHERE id = ?13",
                params![
                    od.status as i64,
                    od.init_price,
                    od.quote_cost,
                    od.exit_tag,
                    od.leverage,
                    od.enter_at,
                    od.exit_at,
                    od.max_pft_rate,
                    od.max_draw_down,
                    od.profit_rate,
                    od.profit,
                    info,
                    od.id,
                ],
            )?;
        }
        let inout_id = od.id;
        if od.dirty_enter {
            od.enter.inout_id = inout_id;
            save_sub(&tx, &mut od.enter)?;
        }
        if od.dirty_exit {
            if let Some(exit) = od.exit.as_mut() {
                exit.inout_id = inout_id;
                save_sub(&tx, exit)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_order(&self, id: i64) -> Result<Option<InOutOrder>> {
        let conn = self.lock();
        let od = conn
            .query_row(
                &format!("SELECT {} FROM iorder WHERE id = ?1", IORDER_COLS),
                params![id],
                read_iorder,
            )
            .optional()?;
        match od {
            Some(mut od) => {
                attach_subs(&conn, std::slice::from_mut(&mut od))?;
                Ok(Some(od))
            }
            None => Ok(None),
        }
    }

    /// Orders matching `filter`, newest entry first.
    pub fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<InOutOrder>> {
        let mut conds: Vec<String> = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        let mut add = |cond: &str, val: Value| {
            args.push(val);
            conds.push(cond.replace('?', &format!("?{}", args.len())));
        };
        if filter.task_id != 0 {
            add("task_id = ?", Value::Integer(filter.task_id));
        }
        if !filter.strategy.is_empty() {
            add("strategy = ?", Value::Text(filter.strategy.clone()));
        }
        if !filter.timeframe.is_empty() {
            add("timeframe = ?", Value::Text(filter.timeframe.clone()));
        }
        match filter.status {
            StatusFilter::All => {}
            StatusFilter::Open => add("status < ?", Value::Integer(InOutStatus::FullExit as i64)),
            StatusFilter::His => add("status >= ?", Value::Integer(InOutStatus::FullExit as i64)),
        }
        match filter.dirt {
            Dirt::Long => add("short = ?", Value::Integer(0)),
            Dirt::Short => add("short = ?", Value::Integer(1)),
            Dirt::Both => {}
        }
        if filter.enter_after > 0 {
            add("enter_at >= ?", Value::Integer(filter.enter_after));
        }
        if filter.enter_before > 0 {
            add("enter_at < ?", Value::Integer(filter.enter_before));
        }
        if !filter.enter_tag.is_empty() {
            add("enter_tag = ?", Value::Text(filter.enter_tag.clone()));
        }
        if !filter.exit_tag.is_empty() {
            add("exit_tag = ?", Value::Text(filter.exit_tag.clone()));
        }
        if !filter.pairs.is_empty() {
            let start = args.len();
            let marks: Vec<String> = (0..filter.pairs.len()).map(|i| format!("?{}", start + i + 1)).collect();
            conds.push(format!("symbol IN ({})", marks.join(", ")));
            args.extend(filter.pairs.iter().map(|p| Value::Text(p.clone())));
        }
        let mut sql = format!("SELECT {} FROM iorder", IORDER_COLS);
        if !conds.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conds.join(" AND "));
        }
        sql.push_str(" ORDER BY enter_at DESC, id DESC");
        if filter.limit > 0 {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", filter.limit, filter.offset));
        }
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut ods = stmt
            .query_map(params_from_iter(args.iter()), read_iorder)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        attach_subs(&conn, &mut ods)?;
        debug!(num = ods.len(), "orders loaded");
        Ok(ods)
    }

    /// Remove an order and its legs.
    pub fn del_order(&self, id: i64) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM exorder WHERE inout_id = ?1", params![id])?;
        let num = tx.execute("DELETE FROM iorder WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(num > 0)
    }

    /// Timeframe each pair last traded on, for one task and strategy.
    pub fn get_hist_order_tfs(&self, task_id: i64, strategy: &str) -> Result<HashMap<String, String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, timeframe FROM iorder WHERE task_id = ?1 AND strategy = ?2 ORDER BY enter_at, id",
        )?;
        let rows = stmt.query_map(params![task_id, strategy], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut res = HashMap::new();
        for row in rows {
            let (symbol, tf) = row?;
            res.insert(symbol, tf);
        }
        Ok(res)
    }
}

fn save_sub(tx: &Transaction<'_>, sub: &mut ExOrder) -> Result<()> {
    if sub.id <= 0 {
        tx.execute(
            &format!(
                "INSERT INTO exorder ({}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                EXORDER_COLS
            ),
            params![
                sub.task_id,
                sub.inout_id,
                sub.symbol,
                sub.enter,
                sub.order_type.as_str(),
                sub.order_id,
                sub.side.as_str(),
                sub.create_at,
                sub.price,
                sub.average,
                sub.amount,
                sub.filled,
                sub.status as i64,
                sub.fee,
                sub.fee_type,
                sub.update_at,
            ],
        )?;
        sub.id = tx.last_insert_rowid();
        return Ok(());
    }
    tx.execute(
        "UPDATE exorder SET order_type = ?1, order_id = ?2, price = ?3, average = ?4, amount = ?5,
            filled = ?6, status = ?7, fee = ?8, fee_type = ?9, update_at = ?10 WHERE id = ?11",
        params![
            sub.order_type.as_str(),
            sub.order_id,
            sub.price,
            sub.average,
            sub.amount,
            sub.filled,
            sub.status as i64,
            sub.fee,
            sub.fee_type,
            sub.update_at,
            sub.id,
        ],
    )?;
    Ok(())
}

fn read_iorder(row: &Row<'_>) -> rusqlite::Result<InOutOrder> {
    let info_text: String = row.get(20)?;
    let info: OrderInfo = if info_text.is_empty() {
        OrderInfo::default()
    } else {
        serde_json::from_str(&info_text).unwrap_or_default()
    };
    let symbol: String = row.get(2)?;
    let short: bool = row.get(5)?;
    let enter_at: i64 = row.get(12)?;
    let side = if short { Side::Sell } else { Side::Buy };
    let mut od = InOutOrder::new(
        row.get(1)?,
        &symbol,
        row.get(3)?,
        &row.get::<_, String>(4)?,
        &row.get::<_, String>(14)?,
        short,
        &row.get::<_, String>(7)?,
        enter_at,
        OrderType::Market,
    );
    od.id = row.get(0)?;
    od.status = InOutStatus::from_i64(row.get(6)?);
    od.init_price = row.get(8)?;
    od.quote_cost = row.get(9)?;
    od.exit_tag = row.get(10)?;
    od.leverage = row.get(11)?;
    od.exit_at = row.get(13)?;
    od.stg_ver = row.get(15)?;
    od.max_pft_rate = row.get(16)?;
    od.max_draw_down = row.get(17)?;
    od.profit_rate = row.get(18)?;
    od.profit = row.get(19)?;
    od.info = info;
    od.enter = ExOrder::new(&symbol, true, side, OrderType::Market, enter_at);
    od.clear_dirty();
    Ok(od)
}

fn read_exorder(row: &Row<'_>) -> rusqlite::Result<ExOrder> {
    let order_type: String = row.get(5)?;
    let side: String = row.get(7)?;
    let mut sub = ExOrder::new(
        &row.get::<_, String>(3)?,
        row.get(4)?,
        Side::parse(&side).unwrap_or(Side::Buy),
        OrderType::parse(&order_type).unwrap_or_default(),
        row.get(8)?,
    );
    sub.id = row.get(0)?;
    sub.task_id = row.get(1)?;
    sub.inout_id = row.get(2)?;
    sub.order_id = row.get(6)?;
    sub.price = row.get(9)?;
    sub.average = row.get(10)?;
    sub.amount = row.get(11)?;
    sub.filled = row.get(12)?;
    sub.status = OdStatus::from_i64(row.get(13)?);
    sub.fee = row.get(14)?;
    sub.fee_type = row.get(15)?;
    sub.update_at = row.get(16)?;
    Ok(sub)
}

/// Load the legs of `ods` and put them in place.
fn attach_subs(conn: &Connection, ods: &mut [InOutOrder]) -> Result<()> {
    if ods.is_empty() {
        return Ok(());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM exorder WHERE inout_id = ?1 ORDER BY id",
        EXORDER_COLS
    ))?;
    for od in ods.iter_mut() {
        let subs = stmt
            .query_map(params![od.id], read_exorder)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for sub in subs {
            if sub.enter {
                od.enter = sub;
            } else {
                od.exit = Some(sub);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::exit_tag;

    fn order(symbol: &str, strategy: &str, enter_at: i64) -> InOutOrder {
        let mut od = InOutOrder::new(1, symbol, 1, "1h", strategy, false, "ent", enter_at, OrderType::Limit);
        od.init_price = 100.0;
        od.quote_cost = 50.0;
        od.enter.amount = 0.5;
        od.enter.price = 99.0;
        od.info.stop_after = enter_at + 3_600_000;
        od
    }

    #[test]
    fn test_save_assigns_ids_and_round_trips() {
        let db = SqliteStateManager::open_in_memory().unwrap();
        let mut od = order("BTC/USDT", "s", 1_000);
        db.save_order(&mut od).unwrap();
        assert!(od.id > 0);
        assert!(od.enter.id > 0);
        assert_eq!(od.enter.inout_id, od.id);

        od.enter.filled = 0.5;
        od.enter.status = OdStatus::Closed;
        od.status = InOutStatus::FullEnter;
        od.dirty_main = true;
        od.dirty_enter = true;
        od.set_exit(2_000, exit_tag::TAKE_PROFIT, None, 0.0);
        od.dirty_exit = true;
        db.save_order(&mut od).unwrap();

        let back = db.get_order(od.id).unwrap().unwrap();
        assert_eq!(back.status, InOutStatus::FullEnter);
        assert_eq!(back.enter.filled, 0.5);
        assert_eq!(back.enter.order_type, OrderType::Limit);
        assert_eq!(back.exit.as_ref().unwrap().amount, 0.5);
        assert_eq!(back.exit_tag, exit_tag::TAKE_PROFIT);
        assert_eq!(back.info.stop_after, 3_601_000);
        assert_eq!(back.key(), od.key());
    }

    #[test]
    fn test_get_orders_filters() {
        let db = SqliteStateManager::open_in_memory().unwrap();
        for (i, sym) in ["BTC/USDT", "ETH/USDT", "BTC/USDT"].iter().enumerate() {
            let mut od = order(sym, "s", (i as i64 + 1) * 1_000);
            if i == 2 {
                od.status = InOutStatus::FullExit;
                od.exit_tag = exit_tag::STOP_LOSS.to_string();
            }
            db.save_order(&mut od).unwrap();
        }
        let mut other = order("BTC/USDT", "t", 9_000);
        other.short = true;
        db.save_order(&mut other).unwrap();

        let all = db.get_orders(&OrderFilter::task(1)).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].enter_at, 9_000);

        let filter = OrderFilter {
            strategy: "s".into(),
            pairs: vec!["BTC/USDT".into()],
            status: StatusFilter::Open,
            ..Default::default()
        };
        assert_eq!(db.get_orders(&filter).unwrap().len(), 1);

        let filter = OrderFilter {
            exit_tag: exit_tag::STOP_LOSS.into(),
            ..Default::default()
        };
        assert_eq!(db.get_orders(&filter).unwrap()[0].enter_at, 3_000);

        let filter = OrderFilter {
            dirt: Dirt::Short,
            ..Default::default()
        };
        assert_eq!(db.get_orders(&filter).unwrap()[0].strategy, "t");

        let filter = OrderFilter {
            enter_after: 2_000,
            enter_before: 9_000,
            limit: 1,
            ..Default::default()
        };
        let page = db.get_orders(&filter).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].enter_at, 3_000);
    }

    #[test]
    fn test_del_order_and_hist_tfs() {
        let db = SqliteStateManager::open_in_memory().unwrap();
        let mut a = order("BTC/USDT", "s", 1_000);
        let mut b = order("BTC/USDT", "s", 2_000);
        b.timeframe = "4h".into();
        db.save_order(&mut a).unwrap();
        db.save_order(&mut b).unwrap();
        let tfs = db.get_hist_order_tfs(1, "s").unwrap();
        assert_eq!(tfs["BTC/USDT"], "4h");
        assert!(db.del_order(b.id).unwrap());
        assert!(db.get_order(b.id).unwrap().is_none());
        assert!(!db.del_order(b.id).unwrap());
    }

    #[test]
    fn test_task_lifecycle() {
        let db = SqliteStateManager::open_in_memory().unwrap();
        let id = db.create_task("backtest", "bot", 1, 2).unwrap();
        db.finish_task(id, 99, "{}").unwrap();
        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.stop_at, 99);
        assert!(db.finish_task(id + 100, 1, "").is_err());
    }
}
