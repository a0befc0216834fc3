//! The default `RelationalStore`/`TimeSeriesStore` implementation, backed
//! by a single long-lived `rusqlite::Connection` per writer. Both logical
//! tables live in the same database file for this default adapter; a real
//! deployment would point `TimeSeriesStore` at an actual time-series engine
//! instead, behind the same trait.

use rusqlite::{params, Connection};

use crate::flow::{PersistedFlow, TimeseriesPoint};

use super::{RelationalStore, StoreError, TimeSeriesStore};

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Relational { message: e.to_string() })?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS flows (
                uuid TEXT PRIMARY KEY,
                raw TEXT NOT NULL,
                agent_address TEXT NOT NULL,
                ifname TEXT NOT NULL,
                src_ip TEXT NOT NULL,
                dst_ip TEXT NOT NULL,
                proto INTEGER NOT NULL,
                src_port INTEGER NOT NULL,
                dst_port INTEGER NOT NULL,
                tos INTEGER NOT NULL,
                bytes INTEGER NOT NULL,
                packets INTEGER NOT NULL,
                start_time REAL NOT NULL,
                end_time REAL NOT NULL,
                flags TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS timeseries (
                seconds INTEGER NOT NULL,
                uuid TEXT NOT NULL,
                agent_address TEXT NOT NULL,
                ifname TEXT NOT NULL,
                src_ip TEXT NOT NULL,
                dst_ip TEXT NOT NULL,
                proto INTEGER NOT NULL,
                src_port INTEGER NOT NULL,
                dst_port INTEGER NOT NULL,
                bytes REAL NOT NULL,
                packets REAL NOT NULL,
                flows REAL NOT NULL
            );",
        )
        .map_err(|e| StoreError::Relational { message: e.to_string() })?;
        Ok(SqliteStore { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    #[cfg(test)]
    pub fn count_flows(&self) -> i64 {
        self.conn
            .query_row("SELECT COUNT(*) FROM flows", [], |row| row.get(0))
            .unwrap()
    }

    #[cfg(test)]
    pub fn count_timeseries(&self) -> i64 {
        self.conn
            .query_row("SELECT COUNT(*) FROM timeseries", [], |row| row.get(0))
            .unwrap()
    }
}

impl RelationalStore for SqliteStore {
    fn insert_flow(&mut self, flow: &PersistedFlow) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO flows (uuid, raw, agent_address, ifname, src_ip, dst_ip, proto, src_port, dst_port, tos, bytes, packets, start_time, end_time, flags)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    flow.uuid.to_string(),
                    flow.raw,
                    flow.agent_address,
                    flow.key.ifname,
                    flow.key.src_ip,
                    flow.key.dst_ip,
                    flow.key.proto,
                    flow.key.src_port,
                    flow.key.dst_port,
                    flow.key.tos,
                    flow.fields.bytes,
                    flow.fields.packets,
                    flow.fields.start_time,
                    flow.fields.end_time,
                    flow.fields.flags,
                ],
            )
            .map_err(|e| StoreError::Relational { message: e.to_string() })?;
        Ok(())
    }
}

impl TimeSeriesStore for SqliteStore {
    fn insert_points(&mut self, points: &[TimeseriesPoint]) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| StoreError::TimeSeries { message: e.to_string() })?;
        for point in points {
            tx.execute(
                "INSERT INTO timeseries (seconds, uuid, agent_address, ifname, src_ip, dst_ip, proto, src_port, dst_port, bytes, packets, flows)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    point.seconds,
                    point.uuid.to_string(),
                    point.agent_address,
                    point.key.ifname,
                    point.key.src_ip,
                    point.key.dst_ip,
                    point.key.proto,
                    point.key.src_port,
                    point.key.dst_port,
                    point.bytes,
                    point.packets,
                    point.flows,
                ],
            )
            .map_err(|e| StoreError::TimeSeries { message: e.to_string() })?;
        }
        tx.commit().map_err(|e| StoreError::TimeSeries { message: e.to_string() })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowFields, FlowKey};

    fn sample_flow() -> PersistedFlow {
        PersistedFlow::new(
            "1.2.3.4".into(),
            FlowKey {
                ifname: "eth0".into(),
                src_ip: "10.0.0.1".into(),
                dst_ip: "10.0.0.2".into(),
                proto: 17,
                src_port: 1000,
                dst_port: 53,
                tos: 0,
            },
            FlowFields {
                bytes: 128,
                packets: 1,
                start_time: 10.0,
                end_time: 10.0,
                flags: "None".into(),
            },
            "raw".into(),
        )
    }

    #[test]
    fn inserts_a_flow_and_its_timeseries_points() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let flow = sample_flow();
        store.insert_flow(&flow).unwrap();
        store.insert_points(&flow.expand_timeseries()).unwrap();
        assert_eq!(store.count_flows(), 1);
        assert_eq!(store.count_timeseries(), 1);
    }
}
