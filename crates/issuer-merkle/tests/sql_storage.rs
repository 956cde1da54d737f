use issuer_crypto::Hash;
use issuer_merkle::{register_trees, IdentityTrees, MemoryStorage, MerkleTree, SqlStorage};
use rusqlite::Connection;

fn test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("should open in-memory db");
    issuer_db::run_migrations(&conn).expect("migrations should succeed");
    conn
}

#[test]
fn sql_and_memory_trees_agree() {
    let conn = test_db();
    let [claims_id, _, _] = register_trees(&conn, "did:test").expect("register");
    let mut sql = MerkleTree::new(SqlStorage::new(&conn, claims_id));
    let mut mem = MerkleTree::new(MemoryStorage::new());

    for k in [3u64, 17, 2, 1024, 99, 5] {
        let key = Hash::from_u64(k);
        let value = Hash::from_u64(k + 1);
        let a = sql.add(&key, &value).expect("sql add");
        let b = mem.add(&key, &value).expect("memory add");
        assert_eq!(a, b);
    }

    let root = sql.root().expect("root");
    let (proof, value) = sql
        .generate_proof(&Hash::from_u64(1024), None)
        .expect("proof");
    assert_eq!(value, Some(Hash::from_u64(1025)));
    assert!(proof
        .verify(&root, &Hash::from_u64(1024), &Hash::from_u64(1025))
        .expect("verify"));
}

#[test]
fn rolled_back_transaction_leaves_root_untouched() {
    let mut conn = test_db();
    register_trees(&conn, "did:test").expect("register");

    {
        let tx = conn.transaction().expect("tx");
        let mut trees = IdentityTrees::open(&tx, "did:test").expect("open");
        trees
            .claims
            .add(&Hash::from_u64(1), &Hash::from_u64(1))
            .expect("add");
        assert_ne!(trees.claims.root().expect("root"), Hash::ZERO);
        // Dropped without commit.
    }

    let trees = IdentityTrees::open(&conn, "did:test").expect("open");
    assert_eq!(trees.claims.root().expect("root"), Hash::ZERO);
}

#[test]
fn committed_nodes_survive_reopen() {
    let mut conn = test_db();
    register_trees(&conn, "did:test").expect("register");

    let root = {
        let tx = conn.transaction().expect("tx");
        let root = {
            let mut trees = IdentityTrees::open(&tx, "did:test").expect("open");
            trees
                .revocations
                .add(&Hash::from_u64(7), &Hash::from_u64(1))
                .expect("add");
            trees
                .revocations
                .add(&Hash::from_u64(8), &Hash::from_u64(1))
                .expect("add");
            trees.revocations.root().expect("root")
        };
        tx.commit().expect("commit");
        root
    };

    let trees = IdentityTrees::open(&conn, "did:test").expect("open");
    assert_eq!(trees.revocations.root().expect("root"), root);
    let (proof, _) = trees
        .revocations
        .generate_proof(&Hash::from_u64(7), None)
        .expect("proof");
    assert!(proof.existence);
}
