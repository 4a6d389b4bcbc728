pub mod pg_tablespace;
