//! Database schema definition for Nereus.

/// Database schema definition.
pub(crate) const SCHEMA: &str = r"
-- Scans known to the local graph store; scan ids are unique per tenant
CREATE TABLE IF NOT EXISTS scans (
    tenant_id TEXT NOT NULL,
    scan_id TEXT NOT NULL,
    repository_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, scan_id)
);

CREATE INDEX IF NOT EXISTS idx_scans_repository ON scans(tenant_id, repository_id, created_at);

-- Graph nodes, read-only to the engines
CREATE TABLE IF NOT EXISTS graph_nodes (
    tenant_id TEXT NOT NULL,
    scan_id TEXT NOT NULL,
    id TEXT NOT NULL,
    repository_id TEXT NOT NULL,
    node_type TEXT NOT NULL,
    name TEXT NOT NULL,
    namespace TEXT,
    attributes TEXT NOT NULL DEFAULT '{}',
    position INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, scan_id, id),
    FOREIGN KEY (tenant_id, scan_id) REFERENCES scans(tenant_id, scan_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_graph_nodes_scan ON graph_nodes(tenant_id, scan_id, position);
CREATE INDEX IF NOT EXISTS idx_graph_nodes_type ON graph_nodes(tenant_id, scan_id, node_type);

-- Graph edges, read-only to the engines
CREATE TABLE IF NOT EXISTS graph_edges (
    tenant_id TEXT NOT NULL,
    scan_id TEXT NOT NULL,
    id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    edge_type TEXT NOT NULL,
    confidence INTEGER NOT NULL CHECK (confidence BETWEEN 0 AND 100),
    attributes TEXT NOT NULL DEFAULT '{}',
    position INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, scan_id, id),
    FOREIGN KEY (tenant_id, scan_id) REFERENCES scans(tenant_id, scan_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_graph_edges_scan ON graph_edges(tenant_id, scan_id, position);
CREATE INDEX IF NOT EXISTS idx_graph_edges_source ON graph_edges(tenant_id, scan_id, source_id);
CREATE INDEX IF NOT EXISTS idx_graph_edges_target ON graph_edges(tenant_id, scan_id, target_id);

-- Denormalized entry per (external id, node) pair
CREATE TABLE IF NOT EXISTS external_object_index (
    id INTEGER PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    external_id TEXT NOT NULL,
    reference_type TEXT NOT NULL,
    normalized_id TEXT NOT NULL,
    reference_hash TEXT NOT NULL,
    repository_id TEXT NOT NULL,
    scan_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    components TEXT NOT NULL DEFAULT '{}',
    indexed_at INTEGER NOT NULL,
    UNIQUE (tenant_id, scan_id, node_id, external_id)
);

CREATE INDEX IF NOT EXISTS idx_eoi_hash ON external_object_index(tenant_id, reference_hash);
CREATE INDEX IF NOT EXISTS idx_eoi_scan ON external_object_index(tenant_id, repository_id, scan_id);

-- Junction between graph nodes and external objects
-- reference_hash = hash(ref_type, normalized external id); it is the only key
-- of the hot lookup path, served by the covering index below.
CREATE TABLE IF NOT EXISTS node_external_objects (
    id INTEGER PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    external_object_id TEXT NOT NULL,
    scan_id TEXT NOT NULL,
    repository_id TEXT NOT NULL,
    reference_hash TEXT NOT NULL,
    ref_type TEXT NOT NULL,
    confidence REAL NOT NULL,
    context TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE (tenant_id, scan_id, node_id, external_object_id)
);

CREATE INDEX IF NOT EXISTS idx_neo_lookup ON node_external_objects(
    tenant_id, repository_id, reference_hash,
    node_id, external_object_id, scan_id, ref_type, confidence, context, created_at
);
CREATE INDEX IF NOT EXISTS idx_neo_tenant_hash ON node_external_objects(tenant_id, reference_hash);
CREATE INDEX IF NOT EXISTS idx_neo_object ON node_external_objects(tenant_id, external_object_id);
CREATE INDEX IF NOT EXISTS idx_neo_node ON node_external_objects(tenant_id, scan_id, node_id);

-- Scans whose references are in the index
CREATE TABLE IF NOT EXISTS indexed_scans (
    tenant_id TEXT NOT NULL,
    scan_id TEXT NOT NULL,
    repository_id TEXT NOT NULL,
    entries INTEGER NOT NULL,
    indexed_at INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, scan_id)
);

-- Index build history
CREATE TABLE IF NOT EXISTS index_builds (
    build_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    request TEXT NOT NULL,
    result TEXT
);

CREATE INDEX IF NOT EXISTS idx_index_builds_tenant ON index_builds(tenant_id, started_at);

-- Saved multi-repository rollups
CREATE TABLE IF NOT EXISTS rollups (
    rollup_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    repository_ids TEXT NOT NULL,
    matchers TEXT NOT NULL,
    merge_options TEXT NOT NULL,
    version INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rollups_tenant ON rollups(tenant_id, name);

-- Rollup runs and their merged graphs
CREATE TABLE IF NOT EXISTS rollup_executions (
    execution_id TEXT PRIMARY KEY,
    rollup_id TEXT NOT NULL REFERENCES rollups(rollup_id) ON DELETE CASCADE,
    tenant_id TEXT NOT NULL,
    status TEXT NOT NULL,
    scan_ids TEXT NOT NULL,
    match_count INTEGER NOT NULL,
    output TEXT,
    error TEXT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_rollup_executions_rollup
    ON rollup_executions(tenant_id, rollup_id, started_at);
";
