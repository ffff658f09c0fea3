//! Catalogue of syncable tables.
//!
//! One static description per entity drives trigger generation, package
//! building and merging, so the three can never disagree about which
//! columns travel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of syncable entity. Declaration order is dependency order and is
/// the order in which a package is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Icon,
    Tag,
    Wallet,
    Currency,
    Account,
    Counterparty,
    Transaction,
    Budget,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Icon,
        EntityKind::Tag,
        EntityKind::Wallet,
        EntityKind::Currency,
        EntityKind::Account,
        EntityKind::Counterparty,
        EntityKind::Transaction,
        EntityKind::Budget,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Icon => "icon",
            Self::Tag => "tag",
            Self::Wallet => "wallet",
            Self::Currency => "currency",
            Self::Account => "account",
            Self::Counterparty => "counterparty",
            Self::Transaction => "transaction",
            Self::Budget => "budget",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn spec(&self) -> &'static TableSpec {
        // CATALOGUE is declared in the same order as EntityKind
        &CATALOGUE[*self as usize]
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl Column {
    const fn new(name: &'static str, ty: ColumnType, nullable: bool) -> Self {
        Self { name, ty, nullable }
    }

    /// Whether a decoded JSON value can be stored in this column.
    pub fn accepts(&self, value: &Value) -> bool {
        match value {
            Value::Null => self.nullable,
            Value::String(_) => self.ty == ColumnType::Text,
            Value::Bool(_) => self.ty == ColumnType::Integer,
            Value::Number(n) => match self.ty {
                ColumnType::Integer => n.is_i64(),
                ColumnType::Real => true,
                ColumnType::Text => false,
            },
            _ => false,
        }
    }
}

const fn text(name: &'static str) -> Column {
    Column::new(name, ColumnType::Text, false)
}
const fn opt_text(name: &'static str) -> Column {
    Column::new(name, ColumnType::Text, true)
}
const fn int(name: &'static str) -> Column {
    Column::new(name, ColumnType::Integer, false)
}
const fn real(name: &'static str) -> Column {
    Column::new(name, ColumnType::Real, false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Uuid,
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created and deleted freely on any device.
    Owned,
    /// Part of a fixed reference set: never inserted or deleted by sync,
    /// only updated when already present locally.
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPolicy {
    /// Delete every link of the parent, then insert the incoming set.
    Replace,
    /// Insert only if absent; an existing local row is never overwritten.
    FirstWriteWins,
}

/// A junction or child table whose rows belong to one parent entity.
#[derive(Debug)]
pub struct Association {
    pub table: &'static str,
    pub parent_column: &'static str,
    pub columns: &'static [Column],
    pub policy: LinkPolicy,
}

#[derive(Debug)]
pub struct TableSpec {
    pub kind: EntityKind,
    pub table: &'static str,
    pub id_type: IdType,
    pub columns: &'static [Column],
    pub associations: &'static [Association],
    pub lifecycle: Lifecycle,
}

impl TableSpec {
    pub fn association(&self, table: &str) -> Option<&'static Association> {
        self.associations.iter().find(|a| a.table == table)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }
}

const TAG_LINK: &[Column] = &[text("tag_id")];

pub static CATALOGUE: [TableSpec; 8] = [
    TableSpec {
        kind: EntityKind::Icon,
        table: "icons",
        id_type: IdType::Uuid,
        columns: &[text("name"), opt_text("glyph")],
        associations: &[],
        lifecycle: Lifecycle::Owned,
    },
    TableSpec {
        kind: EntityKind::Tag,
        table: "tags",
        id_type: IdType::Uuid,
        columns: &[text("name"), opt_text("color"), opt_text("icon_id")],
        associations: &[],
        lifecycle: Lifecycle::Owned,
    },
    TableSpec {
        kind: EntityKind::Wallet,
        table: "wallets",
        id_type: IdType::Uuid,
        columns: &[text("name"), opt_text("icon_id"), int("archived")],
        associations: &[],
        lifecycle: Lifecycle::Owned,
    },
    TableSpec {
        kind: EntityKind::Currency,
        table: "currencies",
        id_type: IdType::Integer,
        columns: &[text("code"), text("name"), opt_text("symbol"), int("decimals")],
        associations: &[
            Association {
                table: "currency_tags",
                parent_column: "currency_id",
                columns: TAG_LINK,
                policy: LinkPolicy::Replace,
            },
            Association {
                table: "currency_rates",
                parent_column: "currency_id",
                columns: &[real("rate"), text("base_code"), int("fetched_at")],
                policy: LinkPolicy::FirstWriteWins,
            },
        ],
        lifecycle: Lifecycle::Reference,
    },
    TableSpec {
        kind: EntityKind::Account,
        table: "accounts",
        id_type: IdType::Uuid,
        columns: &[
            opt_text("wallet_id"),
            text("name"),
            int("currency_id"),
            opt_text("icon_id"),
            int("opening_balance"),
            int("archived"),
        ],
        associations: &[Association {
            table: "account_tags",
            parent_column: "account_id",
            columns: TAG_LINK,
            policy: LinkPolicy::Replace,
        }],
        lifecycle: Lifecycle::Owned,
    },
    TableSpec {
        kind: EntityKind::Counterparty,
        table: "counterparties",
        id_type: IdType::Uuid,
        columns: &[text("name"), opt_text("icon_id")],
        associations: &[
            Association {
                table: "counterparty_tags",
                parent_column: "counterparty_id",
                columns: TAG_LINK,
                policy: LinkPolicy::Replace,
            },
            Association {
                table: "counterparty_notes",
                parent_column: "counterparty_id",
                columns: &[text("note"), int("created_at")],
                policy: LinkPolicy::Replace,
            },
        ],
        lifecycle: Lifecycle::Owned,
    },
    TableSpec {
        kind: EntityKind::Transaction,
        table: "transactions",
        id_type: IdType::Uuid,
        columns: &[
            text("account_id"),
            opt_text("counterparty_id"),
            int("amount"),
            int("currency_id"),
            int("occurred_at"),
            opt_text("description"),
        ],
        associations: &[Association {
            table: "transaction_tags",
            parent_column: "transaction_id",
            columns: TAG_LINK,
            policy: LinkPolicy::Replace,
        }],
        lifecycle: Lifecycle::Owned,
    },
    TableSpec {
        kind: EntityKind::Budget,
        table: "budgets",
        id_type: IdType::Uuid,
        columns: &[
            text("name"),
            int("amount"),
            int("currency_id"),
            text("period"),
            int("starts_at"),
        ],
        associations: &[Association {
            table: "budget_tags",
            parent_column: "budget_id",
            columns: TAG_LINK,
            policy: LinkPolicy::Replace,
        }],
        lifecycle: Lifecycle::Owned,
    },
];
